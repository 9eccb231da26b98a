//! Cross-frame pose alignment for temporal BEV fusion.
//!
//! A BEV feature stored `k` frames ago was rasterised around the ego pose of
//! that frame.  Before it can be fused with the current feature it must be
//! resampled onto the current grid.  [`relative_transform`] gives the rigid
//! motion between the two ego frames; [`PoseAligner`] turns it into the
//! 3×3 grid-space sampling matrix the engine's warp step consumes.
//!
//! # Serialized layout
//!
//! One row-major 3×3 matrix per history slot.  For a current-grid cell at
//! column `c`, row `r`, the engine bilinearly samples the past feature at
//! `M · (c, r, 1)ᵀ`.  With `G` the grid-index → ego-metre map
//!
//! ```text
//! G = | x_step   0      x_start |
//!     |   0    y_step   y_start |
//!     |   0      0        1     |
//! ```
//!
//! the matrix is `M = G⁻¹ · P · G`, where `P` is the planar (x, y) part of
//! the current-ego → past-ego transform.

use bevfuse_types::BevError;

use crate::grid::BevGrid;
use crate::transform::{Mat3, Pose, RigidTransform};

/// Floats per serialized transform.
pub const TRANSFORM_LEN: usize = 9;

/// Rigid transform mapping points in the `past` ego frame into the `current`
/// ego frame: `current⁻¹ ∘ past`.
///
/// Both poses are ego → global and were validated at construction, so no
/// degenerate rotation can reach this function.
pub fn relative_transform(current: &Pose, past: &Pose) -> RigidTransform {
    current.as_transform().inverse().compose(past.as_transform())
}

/// Writes per-slot grid sampling matrices into a buffer allocated once.
#[derive(Debug, Clone)]
pub struct PoseAligner {
    grid_to_ego: Mat3,
    ego_to_grid: Mat3,
    transforms: Vec<f32>,
}

impl PoseAligner {
    /// Create an aligner for `slots` history frames on `grid`.
    pub fn new(slots: usize, grid: &BevGrid) -> Self {
        let (xs, ys) = (grid.x.step, grid.y.step);
        let (x0, y0) = (grid.x.start, grid.y.start);
        let grid_to_ego = Mat3::new([[xs, 0.0, x0], [0.0, ys, y0], [0.0, 0.0, 1.0]]);
        // Steps are positive for a validated grid, so the inverse is exact.
        let ego_to_grid = Mat3::new([
            [1.0 / xs, 0.0, -x0 / xs],
            [0.0, 1.0 / ys, -y0 / ys],
            [0.0, 0.0, 1.0],
        ]);

        let mut transforms = vec![0.0; slots * TRANSFORM_LEN];
        for chunk in transforms.chunks_exact_mut(TRANSFORM_LEN) {
            chunk.copy_from_slice(&Mat3::identity().to_row_major());
        }

        Self {
            grid_to_ego,
            ego_to_grid,
            transforms,
        }
    }

    pub fn slots(&self) -> usize {
        self.transforms.len() / TRANSFORM_LEN
    }

    /// Compute and store the sampling matrix for history `slot`.
    ///
    /// # Errors
    ///
    /// Returns [`BevError::IndexOutOfRange`] when `slot >= slots()`.
    pub fn align(&mut self, slot: usize, current: &Pose, past: &Pose) -> Result<(), BevError> {
        let slots = self.slots();
        if slot >= slots {
            return Err(BevError::IndexOutOfRange {
                index: slot,
                len: slots,
            });
        }

        let matrix = self.grid_matrix(&relative_transform(current, past));
        let offset = slot * TRANSFORM_LEN;
        self.transforms[offset..offset + TRANSFORM_LEN].copy_from_slice(&matrix.to_row_major());
        Ok(())
    }

    /// Sampling matrix of one slot.
    pub fn transform(&self, slot: usize) -> Option<&[f32]> {
        let offset = slot * TRANSFORM_LEN;
        self.transforms.get(offset..offset + TRANSFORM_LEN)
    }

    /// All slots, flattened back to back.
    pub fn transforms(&self) -> &[f32] {
        &self.transforms
    }

    fn grid_matrix(&self, past_to_current: &RigidTransform) -> Mat3 {
        let current_to_past = past_to_current.inverse();
        let r = current_to_past.rotation.to_matrix().m;
        let t = current_to_past.translation;
        let planar = Mat3::new([
            [r[0][0], r[0][1], t.x],
            [r[1][0], r[1][1], t.y],
            [0.0, 0.0, 1.0],
        ]);
        self.ego_to_grid.mul(&planar).mul(&self.grid_to_ego)
    }
}
