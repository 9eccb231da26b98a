//! Sparse view-transform index tables.
//!
//! The depth head predicts, for every camera feature pixel, a distribution
//! over `D` depth bins.  Lifting those samples into the BEV voxel grid is a
//! fixed geometric mapping as long as calibration and grid stay the same, so
//! it is computed once by [`ViewTransformIndexer::build`] and reused for
//! every frame.
//!
//! # Table layout
//!
//! For the `M` samples that land inside the grid, three parallel rank arrays
//! are stored, sorted by destination voxel:
//!
//! | array         | rank formula                                  |
//! |---------------|-----------------------------------------------|
//! | `ranks_bev`   | `iz·(ny·nx) + iy·nx + ix`                     |
//! | `ranks_depth` | `cam·D·H·W + d·H·W + h·W + w`                 |
//! | `ranks_feat`  | `cam·H·W + h·W + w`                           |
//!
//! `interval_starts` / `interval_lengths` describe each maximal run of equal
//! `ranks_bev`, so pooling is a segment sum over contiguous memory with no
//! per-sample scatter.  [`bev_pool`] is the host reference of that pass.

use bevfuse_types::{BevError, CameraCalibration};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::grid::{BevGrid, GridAxis};
use crate::transform::{Mat3, Pose, Vec3};

// ────────────────────────────────────────────────────────────────────────────
// Inputs
// ────────────────────────────────────────────────────────────────────────────

/// Intrinsics and mounting of one camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraGeometry {
    pub intrinsic: Mat3,
    /// Camera → ego pose.
    pub sensor2ego: Pose,
}

impl CameraGeometry {
    pub fn new(intrinsic: Mat3, sensor2ego: Pose) -> Self {
        Self {
            intrinsic,
            sensor2ego,
        }
    }

    /// Validate a raw calibration record.
    pub fn from_calibration(cal: &CameraCalibration) -> Result<Self, BevError> {
        let sensor2ego = Pose::from_raw(cal.sensor2ego_rotation, cal.sensor2ego_translation)
            .map_err(|e| BevError::MalformedPose(format!("camera '{}': {e}", cal.name)))?;
        Ok(Self::new(Mat3::new(cal.intrinsic), sensor2ego))
    }
}

/// Resize-then-crop applied to raw images before they enter the network.
///
/// An original pixel `u` lands at `u · resize_ratio − crop_w` in the network
/// input (same for `v` with `crop_h`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageAugmentation {
    pub resize_ratio: f32,
    pub crop_h: f32,
    pub crop_w: f32,
}

impl ImageAugmentation {
    /// Upper-left 2×2 block of the augmentation matrix.
    pub fn post_rot(&self) -> [[f32; 2]; 2] {
        [[self.resize_ratio, 0.0], [0.0, self.resize_ratio]]
    }

    /// Translation part of the augmentation, `(−crop_w, −crop_h)`.
    pub fn post_trans(&self) -> [f32; 2] {
        [-self.crop_w, -self.crop_h]
    }

    /// Map a network-input pixel back to the original image.
    pub fn undo(&self, u: f32, v: f32) -> (f32, f32) {
        (
            (u + self.crop_w) / self.resize_ratio,
            (v + self.crop_h) / self.resize_ratio,
        )
    }
}

impl Default for ImageAugmentation {
    fn default() -> Self {
        Self {
            resize_ratio: 1.0,
            crop_h: 0.0,
            crop_w: 0.0,
        }
    }
}

/// Static geometry shared by all cameras.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransformParams {
    pub input_h: usize,
    pub input_w: usize,
    pub feat_h: usize,
    pub feat_w: usize,
    pub depth: GridAxis,
    pub grid: BevGrid,
    pub augmentation: ImageAugmentation,
}

// ────────────────────────────────────────────────────────────────────────────
// Output
// ────────────────────────────────────────────────────────────────────────────

/// Immutable index tables produced by [`ViewTransformIndexer::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewTransformTables {
    ranks_bev: Vec<u32>,
    ranks_depth: Vec<u32>,
    ranks_feat: Vec<u32>,
    interval_starts: Vec<u32>,
    interval_lengths: Vec<u32>,
    n_cameras: usize,
    depth_bins: usize,
    feat_h: usize,
    feat_w: usize,
    bev_cells: usize,
    total_samples: usize,
}

impl ViewTransformTables {
    /// Number of in-bounds samples (`M`).
    pub fn valid_count(&self) -> usize {
        self.ranks_bev.len()
    }

    /// Number of voxels receiving at least one sample.
    pub fn unique_cells(&self) -> usize {
        self.interval_starts.len()
    }

    /// Samples considered before bounds filtering.
    pub fn total_samples(&self) -> usize {
        self.total_samples
    }

    /// Voxel count of the destination grid.
    pub fn bev_cells(&self) -> usize {
        self.bev_cells
    }

    /// Required length of the depth tensor `[cams, D, H, W]`.
    pub fn depth_len(&self) -> usize {
        self.n_cameras * self.depth_bins * self.feat_h * self.feat_w
    }

    /// Number of feature pixels over all cameras (`cams · H · W`).
    pub fn feat_pixels(&self) -> usize {
        self.n_cameras * self.feat_h * self.feat_w
    }

    /// Destination voxel of each valid sample, sorted ascending.
    pub fn ranks_bev(&self) -> &[u32] {
        &self.ranks_bev
    }

    /// Index into the depth tensor, parallel to [`ranks_bev`][Self::ranks_bev].
    pub fn ranks_depth(&self) -> &[u32] {
        &self.ranks_depth
    }

    /// Index of the feature pixel, parallel to [`ranks_bev`][Self::ranks_bev].
    pub fn ranks_feat(&self) -> &[u32] {
        &self.ranks_feat
    }

    pub fn interval_starts(&self) -> &[u32] {
        &self.interval_starts
    }

    pub fn interval_lengths(&self) -> &[u32] {
        &self.interval_lengths
    }

    /// `(start, length)` of each run.
    pub fn intervals(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.interval_starts
            .iter()
            .zip(&self.interval_lengths)
            .map(|(&s, &l)| (s as usize, l as usize))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ViewTransformIndexer
// ────────────────────────────────────────────────────────────────────────────

/// Builds [`ViewTransformTables`] for a fixed camera rig.
#[derive(Debug, Clone)]
pub struct ViewTransformIndexer {
    params: ViewTransformParams,
    expected_cameras: usize,
}

impl ViewTransformIndexer {
    pub fn new(params: ViewTransformParams, expected_cameras: usize) -> Self {
        Self {
            params,
            expected_cameras,
        }
    }

    /// Project every `(camera, depth bin, pixel)` sample into the grid and
    /// group the survivors by destination voxel.
    ///
    /// Samples outside the grid (or with non-finite coordinates) are dropped.
    ///
    /// # Errors
    ///
    /// - [`BevError::CameraCountMismatch`] when `cameras.len()` differs from
    ///   the configured count.
    /// - [`BevError::Config`] for a singular intrinsic matrix, a zero-sized
    ///   feature map, or ranks that do not fit in 32 bits.
    pub fn build(&self, cameras: &[CameraGeometry]) -> Result<ViewTransformTables, BevError> {
        if cameras.len() != self.expected_cameras {
            return Err(BevError::CameraCountMismatch {
                expected: self.expected_cameras,
                actual: cameras.len(),
            });
        }

        let p = &self.params;
        if p.feat_h == 0 || p.feat_w == 0 || p.input_h == 0 || p.input_w == 0 {
            return Err(BevError::Config(format!(
                "image {}x{} / feature {}x{} must be non-empty",
                p.input_w, p.input_h, p.feat_w, p.feat_h
            )));
        }
        if !(p.augmentation.resize_ratio.is_finite() && p.augmentation.resize_ratio > 0.0) {
            return Err(BevError::Config(format!(
                "resize ratio must be positive, got {}",
                p.augmentation.resize_ratio
            )));
        }

        let depth_bins = p.depth.cell_count()?;
        let hw = p.feat_h * p.feat_w;
        let total = cameras.len() * depth_bins * hw;
        if total > u32::MAX as usize || p.grid.cells() > u32::MAX as usize {
            return Err(BevError::Config(format!(
                "{total} samples / {} voxels exceed 32-bit ranks",
                p.grid.cells()
            )));
        }

        let us = linspace(p.input_w, p.feat_w);
        let vs = linspace(p.input_h, p.feat_h);

        let mut samples: Vec<(u32, u32, u32)> = Vec::new();
        for (cam, geometry) in cameras.iter().enumerate() {
            let k_inv = geometry.intrinsic.inverse().ok_or_else(|| {
                BevError::Config(format!("camera {cam}: intrinsic matrix is singular"))
            })?;
            let cam_to_ego = geometry.sensor2ego.rotation().to_matrix().mul(&k_inv);
            let trans = geometry.sensor2ego.translation();

            for d in 0..depth_bins {
                let depth = p.depth.value_at(d);
                for (h, &v) in vs.iter().enumerate() {
                    for (w, &u) in us.iter().enumerate() {
                        let (u0, v0) = p.augmentation.undo(u, v);
                        let ego = cam_to_ego
                            .mul_vec(Vec3::new(u0 * depth, v0 * depth, depth))
                            .add(trans);
                        let Some(rank_bev) = p.grid.rank_of(ego.x, ego.y, ego.z) else {
                            continue;
                        };
                        let pixel = cam * hw + h * p.feat_w + w;
                        let rank_depth = (cam * depth_bins + d) * hw + h * p.feat_w + w;
                        samples.push((rank_bev as u32, rank_depth as u32, pixel as u32));
                    }
                }
            }
        }

        // Stable: within a voxel, samples keep (camera, depth, pixel) order.
        samples.sort_by_key(|&(bev, _, _)| bev);

        let mut tables = ViewTransformTables {
            ranks_bev: Vec::with_capacity(samples.len()),
            ranks_depth: Vec::with_capacity(samples.len()),
            ranks_feat: Vec::with_capacity(samples.len()),
            interval_starts: Vec::new(),
            interval_lengths: Vec::new(),
            n_cameras: cameras.len(),
            depth_bins,
            feat_h: p.feat_h,
            feat_w: p.feat_w,
            bev_cells: p.grid.cells(),
            total_samples: total,
        };

        for (i, &(bev, depth, feat)) in samples.iter().enumerate() {
            if i == 0 || tables.ranks_bev[i - 1] != bev {
                tables.interval_starts.push(i as u32);
                tables.interval_lengths.push(0);
            }
            if let Some(len) = tables.interval_lengths.last_mut() {
                *len += 1;
            }
            tables.ranks_bev.push(bev);
            tables.ranks_depth.push(depth);
            tables.ranks_feat.push(feat);
        }

        debug!(
            dropped = total - tables.valid_count(),
            "view transform samples outside the grid"
        );
        info!(
            valid = tables.valid_count(),
            unique = tables.unique_cells(),
            total,
            "view transform tables built"
        );
        Ok(tables)
    }
}

/// `n` evenly spaced sample positions over `[0, extent - 1]`.
fn linspace(extent: usize, n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![0.0; n];
    }
    let step = (extent as f32 - 1.0) / (n as f32 - 1.0);
    (0..n).map(|i| i as f32 * step).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Segment-sum pooling
// ────────────────────────────────────────────────────────────────────────────

/// Host reference of the grouped BEV pooling pass.
///
/// - `depth`: `[cams, D, H, W]` depth probabilities.
/// - `feat`: `[cams, H, W, channels]` context features.
/// - `out`: `[bev_cells, channels]`; zero-filled first so voxels without a
///   run read as zero.
///
/// # Errors
///
/// Returns [`BevError::TensorShape`] when any slice length disagrees with the
/// tables.
pub fn bev_pool(
    tables: &ViewTransformTables,
    depth: &[f32],
    feat: &[f32],
    channels: usize,
    out: &mut [f32],
) -> Result<(), BevError> {
    check_len("depth", tables.depth_len(), depth.len())?;
    check_len("feat", tables.feat_pixels() * channels, feat.len())?;
    check_len("bev_pool_out", tables.bev_cells() * channels, out.len())?;

    out.fill(0.0);
    for (start, len) in tables.intervals() {
        let cell = tables.ranks_bev[start] as usize;
        let acc = &mut out[cell * channels..(cell + 1) * channels];
        for i in start..start + len {
            let weight = depth[tables.ranks_depth[i] as usize];
            let f = tables.ranks_feat[i] as usize * channels;
            for (a, x) in acc.iter_mut().zip(&feat[f..f + channels]) {
                *a += weight * x;
            }
        }
    }
    Ok(())
}

fn check_len(name: &str, expected: usize, actual: usize) -> Result<(), BevError> {
    if expected == actual {
        Ok(())
    } else {
        Err(BevError::TensorShape {
            name: name.to_string(),
            expected,
            actual,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Quaternion;

    /// Forward-looking camera: optical axis (cam +z) along ego +x, cam +x
    /// along ego −y, cam +y along ego −z.
    fn front_camera() -> CameraGeometry {
        let k = Mat3::new([[1.0, 0.0, 1.0], [0.0, 1.0, 1.0], [0.0, 0.0, 1.0]]);
        let rot = Quaternion::new(0.5, -0.5, 0.5, -0.5);
        CameraGeometry::new(k, Pose::try_new(rot, Vec3::zero()).unwrap())
    }

    fn params() -> ViewTransformParams {
        ViewTransformParams {
            input_h: 3,
            input_w: 3,
            feat_h: 3,
            feat_w: 3,
            depth: GridAxis::new(1.0, 3.0, 1.0),
            grid: BevGrid::new(
                GridAxis::new(0.0, 4.0, 1.0),
                GridAxis::new(-2.0, 2.0, 1.0),
                GridAxis::new(-1.0, 1.0, 2.0),
            )
            .unwrap(),
            augmentation: ImageAugmentation::default(),
        }
    }

    fn build_one() -> ViewTransformTables {
        ViewTransformIndexer::new(params(), 1)
            .build(&[front_camera()])
            .unwrap()
    }

    #[test]
    fn projects_known_samples_into_expected_voxels() {
        let tables = build_one();
        assert_eq!(tables.total_samples(), 18);
        assert_eq!(tables.valid_count(), 8);
        assert_eq!(tables.unique_cells(), 5);
        assert_eq!(tables.ranks_bev(), &[2, 5, 5, 9, 9, 10, 13, 13]);
    }

    #[test]
    fn runs_keep_depth_then_pixel_order() {
        let tables = build_one();
        // Voxel 9 is hit by the centre column at depth 1 from rows 1 and 2.
        let (start, len) = tables.intervals().nth(2).unwrap();
        assert_eq!(len, 2);
        assert_eq!(&tables.ranks_depth()[start..start + len], &[4, 7]);
        assert_eq!(&tables.ranks_feat()[start..start + len], &[4, 7]);
    }

    #[test]
    fn intervals_partition_valid_samples() {
        let tables = build_one();
        let mut expected_start = 0;
        let mut seen = Vec::new();
        for (start, len) in tables.intervals() {
            assert_eq!(start, expected_start, "gap or overlap before run at {start}");
            assert!(len > 0);
            let cell = tables.ranks_bev()[start];
            assert!(tables.ranks_bev()[start..start + len].iter().all(|&r| r == cell));
            assert!(!seen.contains(&cell), "voxel {cell} split across runs");
            seen.push(cell);
            expected_start += len;
        }
        assert_eq!(expected_start, tables.valid_count());
        assert!(tables.ranks_bev().windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn ranks_index_inside_their_tensors() {
        let tables = build_one();
        let n = tables.valid_count();
        assert_eq!(tables.ranks_depth().len(), n);
        assert_eq!(tables.ranks_feat().len(), n);
        assert_eq!(tables.interval_starts().len(), tables.interval_lengths().len());
        assert!(tables.ranks_bev().iter().all(|&r| (r as usize) < tables.bev_cells()));
        assert!(tables.ranks_depth().iter().all(|&r| (r as usize) < tables.depth_len()));
        assert!(tables.ranks_feat().iter().all(|&r| (r as usize) < tables.feat_pixels()));
    }

    #[test]
    fn camera_count_mismatch_is_fatal() {
        let indexer = ViewTransformIndexer::new(params(), 2);
        let err = indexer.build(&[front_camera()]).unwrap_err();
        assert_eq!(
            err,
            BevError::CameraCountMismatch {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn singular_intrinsics_are_rejected() {
        let mut cam = front_camera();
        cam.intrinsic = Mat3::diag(1.0, 0.0, 1.0);
        let err = ViewTransformIndexer::new(params(), 1).build(&[cam]).unwrap_err();
        assert!(matches!(err, BevError::Config(_)));
    }

    #[test]
    fn grid_behind_camera_yields_empty_tables() {
        let mut p = params();
        p.grid = BevGrid::new(
            GridAxis::new(-4.0, 0.0, 1.0),
            GridAxis::new(-2.0, 2.0, 1.0),
            GridAxis::new(-1.0, 1.0, 2.0),
        )
        .unwrap();
        let tables = ViewTransformIndexer::new(p, 1).build(&[front_camera()]).unwrap();
        assert_eq!(tables.valid_count(), 0);
        assert_eq!(tables.unique_cells(), 0);
    }

    #[test]
    fn augmentation_undo_inverts_resize_and_crop() {
        let aug = ImageAugmentation {
            resize_ratio: 0.5,
            crop_h: 10.0,
            crop_w: 4.0,
        };
        let (u, v) = aug.undo(100.0 * 0.5 - 4.0, 60.0 * 0.5 - 10.0);
        assert!((u - 100.0).abs() < 1e-4 && (v - 60.0).abs() < 1e-4);
        assert_eq!(aug.post_trans(), [-4.0, -10.0]);
    }

    #[test]
    fn linspace_covers_input_extent() {
        assert_eq!(linspace(5, 3), vec![0.0, 2.0, 4.0]);
        assert_eq!(linspace(7, 1), vec![0.0]);
    }

    #[test]
    fn bev_pool_sums_runs_and_zeroes_empty_cells() {
        let tables = build_one();
        let channels = 2;
        let depth = vec![0.5; tables.depth_len()];
        let feat: Vec<f32> = (0..tables.feat_pixels() * channels).map(|i| i as f32).collect();
        let mut out = vec![f32::NAN; tables.bev_cells() * channels];

        bev_pool(&tables, &depth, &feat, channels, &mut out).unwrap();

        // Voxel 9 pools pixels 4 and 7: 0.5 * (8 + 14), 0.5 * (9 + 15).
        assert_eq!(&out[18..20], &[11.0, 12.0]);
        // Voxel 0 receives nothing and must read as zero, not garbage.
        assert_eq!(&out[0..2], &[0.0, 0.0]);
        assert!(out.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn bev_pool_rejects_mismatched_lengths() {
        let tables = build_one();
        let mut out = vec![0.0; tables.bev_cells()];
        let err = bev_pool(&tables, &[0.0; 3], &[0.0; 9], 1, &mut out).unwrap_err();
        assert!(matches!(err, BevError::TensorShape { ref name, .. } if name == "depth"));
    }
}
