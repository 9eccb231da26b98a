//! Human and JSON summaries for the `check` and `tables` commands.

use bevfuse_perception::view_transform::ViewTransformTables;
use bevfuse_runtime::BevDetConfig;
use bevfuse_types::BevError;
use serde::Serialize;

/// Static facts about a validated pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub cameras: Vec<String>,
    /// `[nx, ny, nz]`.
    pub grid: [usize; 3],
    pub depth_bins: usize,
    /// `[feat_h, feat_w]`.
    pub feature_map: [usize; 2],
    /// `[bev_h, bev_w]` of the detection heads.
    pub head: [usize; 2],
    pub tasks: usize,
    pub classes: usize,
    pub history_frames: usize,
    pub history_bytes: usize,
}

impl PipelineSummary {
    pub fn new(config: &BevDetConfig, cameras: Vec<String>) -> Result<Self, BevError> {
        let grid = config.grid()?;
        let pp = config.postprocess_config()?;
        let history_frames = if config.use_adj { config.adj_num } else { 0 };
        Ok(Self {
            cameras,
            grid: [grid.nx(), grid.ny(), grid.nz()],
            depth_bins: config.depth.cell_count()?,
            feature_map: [config.feat_h(), config.feat_w()],
            head: [pp.bev_h, pp.bev_w],
            tasks: pp.class_num_per_task.len(),
            classes: pp.class_num(),
            history_frames,
            history_bytes: history_frames * config.feature_bytes()?,
        })
    }
}

/// Occupancy statistics of a set of view-transform tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStats {
    pub total_samples: usize,
    pub valid_samples: usize,
    pub dropped_samples: usize,
    pub bev_cells: usize,
    pub occupied_cells: usize,
    /// Share of grid cells with at least one sample, in `[0, 1]`.
    pub occupancy: f64,
    pub longest_run: usize,
    pub mean_run: f64,
}

impl TableStats {
    pub fn from_tables(tables: &ViewTransformTables) -> Self {
        let valid = tables.valid_count();
        let occupied = tables.unique_cells();
        let longest_run = tables.intervals().map(|(_, len)| len).max().unwrap_or(0);
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        Self {
            total_samples: tables.total_samples(),
            valid_samples: valid,
            dropped_samples: tables.total_samples() - valid,
            bev_cells: tables.bev_cells(),
            occupied_cells: occupied,
            occupancy: ratio(occupied, tables.bev_cells()),
            longest_run,
            mean_run: ratio(valid, occupied),
        }
    }
}
