//! 3-D detection postprocessing.
//!
//! Reduces the raw, per-cell outputs of each task head into a ranked,
//! de-duplicated list of [`Box3D`]s.  A *task head* owns a contiguous range
//! of classes and one set of regression maps.  Per head:
//!
//! 1. **Threshold** – keep cells whose best class score reaches the class
//!    threshold.
//! 2. **Decode** – turn the regression channels and the cell coordinate into
//!    an ego-frame box, following the configured [`DecodeContract`].
//! 3. **Per-class top-K** – at most `nms_pre_maxnum` candidates per class.
//! 4. **Rescale** – footprints are scaled by the class's
//!    `nms_rescale_factor` for the overlap test only.
//! 5. **Rotated NMS** – greedy, per class, suppressing IoU above
//!    `nms_overlap_thresh`.
//! 6. **Final top-K** – `nms_post_maxnum` highest scores across the head's
//!    classes.
//!
//! All sorts are stable, so identical inputs always produce identical
//! outputs; ties keep row-major cell order.
//!
//! # Tensor layout
//!
//! Every map is channel-major `[channels, bev_h, bev_w]`:
//!
//! | output    | channels                          |
//! |-----------|-----------------------------------|
//! | `reg`     | 2 (sub-cell x, y offset)          |
//! | `height`  | 1                                 |
//! | `dim`     | 3 (x, y, z extent)                |
//! | `rot`     | 2 (sin, cos) or 1 (angle)         |
//! | `vel`     | 2, optional                       |
//! | `heatmap` | classes of the task               |

use std::collections::HashMap;

use bevfuse_types::{BevError, Box3D};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::grid::GridAxis;
use crate::iou::{RotatedRect, rotated_iou};

// ────────────────────────────────────────────────────────────────────────────
// Decode contract
// ────────────────────────────────────────────────────────────────────────────

/// How the `rot` channels encode heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YawEncoding {
    /// Two channels, `sin(yaw)` then `cos(yaw)`.
    #[default]
    SinCos,
    /// One channel holding the angle in radians.
    Angle,
}

/// How the `dim` channels encode box extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeEncoding {
    /// Natural log of the extent.
    #[default]
    Log,
    Linear,
}

/// Activation applied to heatmap logits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreActivation {
    #[default]
    Sigmoid,
    /// The heatmap already holds probabilities.
    Identity,
}

impl ScoreActivation {
    fn apply(self, logit: f32) -> f32 {
        match self {
            Self::Sigmoid => 1.0 / (1.0 + (-logit).exp()),
            Self::Identity => logit,
        }
    }
}

/// Output convention of the trained model's regression heads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecodeContract {
    #[serde(default)]
    pub yaw: YawEncoding,
    #[serde(default)]
    pub size: SizeEncoding,
    #[serde(default)]
    pub score: ScoreActivation,
    /// Report `z` at the box bottom: `height` minus half the z extent.
    #[serde(default)]
    pub bottom_center: bool,
}

impl DecodeContract {
    pub fn rot_channels(&self) -> usize {
        match self.yaw {
            YawEncoding::SinCos => 2,
            YawEncoding::Angle => 1,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Everything the postprocessor needs; validated by
/// [`DetectionPostprocessor::new`].
#[derive(Debug, Clone, PartialEq)]
pub struct PostprocessConfig {
    /// Number of classes owned by each task head, in head order.
    pub class_num_per_task: Vec<usize>,
    pub score_thresh: f32,
    /// Optional per-class override of `score_thresh` (global class order).
    pub class_score_thresh: Option<Vec<f32>>,
    pub nms_overlap_thresh: f32,
    pub nms_pre_maxnum: usize,
    pub nms_post_maxnum: usize,
    /// Footprint scale per global class, applied for overlap only.
    pub nms_rescale_factor: Vec<f32>,
    pub decode: DecodeContract,
    pub with_velocity: bool,
    pub bev_h: usize,
    pub bev_w: usize,
    pub x: GridAxis,
    pub y: GridAxis,
    /// Head-resolution cell size in grid cells.
    pub out_size_factor: f32,
    /// `[xmin, ymin, zmin, xmax, ymax, zmax]` filter on decoded centres.
    pub post_center_range: Option<[f32; 6]>,
}

impl PostprocessConfig {
    pub fn class_num(&self) -> usize {
        self.class_num_per_task.iter().sum()
    }

    /// Channel count of each named output for `task`.
    pub fn head_channels(&self, task: usize) -> HashMap<&'static str, usize> {
        let mut map = HashMap::from([
            ("reg", 2),
            ("height", 1),
            ("dim", 3),
            ("rot", self.decode.rot_channels()),
            ("heatmap", self.class_num_per_task.get(task).copied().unwrap_or(0)),
        ]);
        if self.with_velocity {
            map.insert("vel", 2);
        }
        map
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tensors
// ────────────────────────────────────────────────────────────────────────────

/// Raw outputs of one task head.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskHeadTensors {
    pub reg: Vec<f32>,
    pub height: Vec<f32>,
    pub dim: Vec<f32>,
    pub rot: Vec<f32>,
    pub vel: Option<Vec<f32>>,
    pub heatmap: Vec<f32>,
}

impl TaskHeadTensors {
    /// Zero-filled tensors shaped for `task` of `config`.
    pub fn zeros(config: &PostprocessConfig, task: usize) -> Self {
        let hw = config.bev_h * config.bev_w;
        let ch = config.head_channels(task);
        let buf = |name: &str| vec![0.0; ch.get(name).copied().unwrap_or(0) * hw];
        Self {
            reg: buf("reg"),
            height: buf("height"),
            dim: buf("dim"),
            rot: buf("rot"),
            vel: config.with_velocity.then(|| buf("vel")),
            heatmap: buf("heatmap"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DetectionPostprocessor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Candidate {
    det: Box3D,
    footprint: RotatedRect,
}

/// Turns raw task-head tensors into final detections.
#[derive(Debug, Clone)]
pub struct DetectionPostprocessor {
    config: PostprocessConfig,
    /// Global class id of each task's first class.
    class_offsets: Vec<usize>,
}

impl DetectionPostprocessor {
    /// # Errors
    ///
    /// Returns [`BevError::Config`] when the task list is empty, a task owns
    /// no class, a per-class vector has the wrong length, a rescale factor is
    /// not a positive number, or thresholds are out of range.
    pub fn new(config: PostprocessConfig) -> Result<Self, BevError> {
        if config.class_num_per_task.is_empty() || config.class_num_per_task.contains(&0) {
            return Err(BevError::Config(format!(
                "every task head needs at least one class, got {:?}",
                config.class_num_per_task
            )));
        }
        let classes = config.class_num();
        if config.nms_rescale_factor.len() != classes {
            return Err(BevError::Config(format!(
                "nms_rescale_factor has {} entries for {classes} classes",
                config.nms_rescale_factor.len()
            )));
        }
        if let Some((class, f)) = config
            .nms_rescale_factor
            .iter()
            .enumerate()
            .find(|(_, f)| !(f.is_finite() && **f > 0.0))
        {
            return Err(BevError::Config(format!(
                "nms_rescale_factor[{class}] = {f} must be finite and positive"
            )));
        }
        if let Some(per_class) = &config.class_score_thresh
            && per_class.len() != classes
        {
            return Err(BevError::Config(format!(
                "class_score_thresh has {} entries for {classes} classes",
                per_class.len()
            )));
        }
        if !(0.0..=1.0).contains(&config.nms_overlap_thresh) {
            return Err(BevError::Config(format!(
                "nms_overlap_thresh {} outside [0, 1]",
                config.nms_overlap_thresh
            )));
        }
        if config.bev_h == 0 || config.bev_w == 0 {
            return Err(BevError::Config("head resolution must be non-empty".into()));
        }

        let class_offsets = config
            .class_num_per_task
            .iter()
            .scan(0, |acc, &n| {
                let start = *acc;
                *acc += n;
                Some(start)
            })
            .collect();

        Ok(Self {
            config,
            class_offsets,
        })
    }

    pub fn config(&self) -> &PostprocessConfig {
        &self.config
    }

    /// Run all six steps over every task head.
    ///
    /// Detections are concatenated in task order; within a task they are
    /// sorted by descending score.  An empty list is a valid result.
    ///
    /// # Errors
    ///
    /// Returns [`BevError::TensorShape`] when the number of heads or any
    /// tensor length disagrees with the configuration.
    pub fn process(&self, heads: &[TaskHeadTensors]) -> Result<Vec<Box3D>, BevError> {
        if heads.len() != self.config.class_num_per_task.len() {
            return Err(BevError::TensorShape {
                name: "task_heads".to_string(),
                expected: self.config.class_num_per_task.len(),
                actual: heads.len(),
            });
        }

        let mut out = Vec::new();
        for (task, head) in heads.iter().enumerate() {
            self.check_shapes(task, head)?;
            let kept = self.process_task(task, head);
            debug!(task, kept = kept.len(), "task head postprocessed");
            out.extend(kept);
        }
        Ok(out)
    }

    fn process_task(&self, task: usize, head: &TaskHeadTensors) -> Vec<Box3D> {
        let cfg = &self.config;
        let offset = self.class_offsets[task];
        let mut per_class: Vec<Vec<Candidate>> = vec![Vec::new(); cfg.class_num_per_task[task]];

        for cand in self.decode_task(task, head) {
            per_class[cand.det.class_id - offset].push(cand);
        }

        let mut kept = Vec::new();
        for mut cands in per_class {
            if cands.is_empty() {
                continue;
            }
            sort_by_score(&mut cands);
            cands.truncate(cfg.nms_pre_maxnum);
            kept.extend(nms(&cands, cfg.nms_overlap_thresh));
        }

        sort_by_score(&mut kept);
        kept.truncate(cfg.nms_post_maxnum);
        kept.into_iter().map(|c| c.det).collect()
    }

    fn decode_task(&self, task: usize, head: &TaskHeadTensors) -> Vec<Candidate> {
        let cfg = &self.config;
        let hw = cfg.bev_h * cfg.bev_w;
        let offset = self.class_offsets[task];
        let classes = cfg.class_num_per_task[task];
        let mut cands = Vec::new();

        for idx in 0..hw {
            let (row, col) = (idx / cfg.bev_w, idx % cfg.bev_w);

            let mut label = 0;
            let mut best = f32::NEG_INFINITY;
            for c in 0..classes {
                let v = head.heatmap[c * hw + idx];
                if v > best {
                    best = v;
                    label = c;
                }
            }
            let class_id = offset + label;
            let score = cfg.decode.score.apply(best);
            if score.is_nan() || score < self.threshold(class_id) {
                continue;
            }

            let cell_x = cfg.out_size_factor * cfg.x.step;
            let cell_y = cfg.out_size_factor * cfg.y.step;
            let x = (col as f32 + head.reg[idx]) * cell_x + cfg.x.start;
            let y = (row as f32 + head.reg[hw + idx]) * cell_y + cfg.y.start;

            let mut size = [head.dim[idx], head.dim[hw + idx], head.dim[2 * hw + idx]];
            if cfg.decode.size == SizeEncoding::Log {
                size = size.map(f32::exp);
            }

            let mut z = head.height[idx];
            if cfg.decode.bottom_center {
                z -= size[2] * 0.5;
            }

            let yaw = match cfg.decode.yaw {
                YawEncoding::SinCos => head.rot[idx].atan2(head.rot[hw + idx]),
                YawEncoding::Angle => head.rot[idx],
            };

            let velocity = head.vel.as_ref().map(|v| [v[idx], v[hw + idx]]);

            if let Some(r) = cfg.post_center_range
                && !(x >= r[0] && y >= r[1] && z >= r[2] && x <= r[3] && y <= r[4] && z <= r[5])
            {
                continue;
            }

            let factor = cfg.nms_rescale_factor[class_id];
            cands.push(Candidate {
                det: Box3D {
                    center: [x, y, z],
                    size,
                    yaw,
                    velocity,
                    class_id,
                    score,
                },
                footprint: RotatedRect::new(x, y, size[0] * factor, size[1] * factor, yaw),
            });
        }
        cands
    }

    fn threshold(&self, class_id: usize) -> f32 {
        self.config
            .class_score_thresh
            .as_ref()
            .and_then(|t| t.get(class_id).copied())
            .unwrap_or(self.config.score_thresh)
    }

    fn check_shapes(&self, task: usize, head: &TaskHeadTensors) -> Result<(), BevError> {
        let hw = self.config.bev_h * self.config.bev_w;
        let channels = self.config.head_channels(task);
        let check = |name: &str, actual: usize| -> Result<(), BevError> {
            let expected = channels.get(name).copied().unwrap_or(0) * hw;
            if expected == actual {
                Ok(())
            } else {
                Err(BevError::TensorShape {
                    name: format!("task{task}.{name}"),
                    expected,
                    actual,
                })
            }
        };
        check("reg", head.reg.len())?;
        check("height", head.height.len())?;
        check("dim", head.dim.len())?;
        check("rot", head.rot.len())?;
        check("heatmap", head.heatmap.len())?;
        match (&head.vel, self.config.with_velocity) {
            (Some(v), true) => check("vel", v.len()),
            (None, false) => Ok(()),
            (v, _) => Err(BevError::TensorShape {
                name: format!("task{task}.vel"),
                expected: channels.get("vel").copied().unwrap_or(0) * hw,
                actual: v.as_ref().map_or(0, Vec::len),
            }),
        }
    }
}

fn sort_by_score(cands: &mut [Candidate]) {
    cands.sort_by(|a, b| b.det.score.total_cmp(&a.det.score));
}

/// Greedy NMS over candidates already sorted by descending score.
fn nms(sorted: &[Candidate], overlap_thresh: f32) -> Vec<Candidate> {
    let mut kept: Vec<Candidate> = Vec::new();
    for cand in sorted {
        let suppressed = kept
            .iter()
            .any(|k| rotated_iou(&k.footprint, &cand.footprint) > overlap_thresh);
        if !suppressed {
            kept.push(*cand);
        }
    }
    kept
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
