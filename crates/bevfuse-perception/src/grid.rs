//! Axis-aligned voxel grid definitions.
//!
//! Every index computation downstream (view-transform ranks, decode of head
//! outputs, grid-space alignment matrices) assumes that each axis divides
//! evenly into cells.  [`GridAxis::cell_count`] enforces that once, at
//! configuration time.

use bevfuse_types::BevError;
use serde::{Deserialize, Serialize};

/// Relative tolerance used when checking that `(end - start) / step` is whole.
const CELL_COUNT_TOLERANCE: f32 = 1e-4;

/// One `(start, end, step)` axis, in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridAxis {
    pub start: f32,
    pub end: f32,
    pub step: f32,
}

impl GridAxis {
    pub fn new(start: f32, end: f32, step: f32) -> Self {
        Self { start, end, step }
    }

    /// Number of cells along this axis.
    ///
    /// # Errors
    ///
    /// Returns [`BevError::Config`] when the step is not positive, the range
    /// is empty, or the range is not an integer multiple of the step.
    pub fn cell_count(&self) -> Result<usize, BevError> {
        if self.step.is_nan()
            || self.step <= 0.0
            || !self.start.is_finite()
            || !self.end.is_finite()
        {
            return Err(BevError::Config(format!("invalid grid axis {self:?}")));
        }
        let cells = (self.end - self.start) / self.step;
        let rounded = cells.round();
        if rounded < 1.0 {
            return Err(BevError::Config(format!(
                "grid axis {self:?} spans no cells"
            )));
        }
        if (cells - rounded).abs() > CELL_COUNT_TOLERANCE * rounded.max(1.0) {
            return Err(BevError::Config(format!(
                "grid axis {self:?}: (end - start) / step = {cells} is not an integer"
            )));
        }
        Ok(rounded as usize)
    }

    /// Cell index of `value`, or `None` when it falls outside the axis.
    pub fn cell_of(&self, value: f32, count: usize) -> Option<usize> {
        let idx = ((value - self.start) / self.step).floor();
        if idx.is_finite() && idx >= 0.0 && (idx as usize) < count {
            Some(idx as usize)
        } else {
            None
        }
    }

    /// Coordinate of sample `index`: `start + index * step`.
    pub fn value_at(&self, index: usize) -> f32 {
        self.start + index as f32 * self.step
    }
}

/// The BEV voxel grid: three validated axes with cached cell counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BevGrid {
    pub x: GridAxis,
    pub y: GridAxis,
    pub z: GridAxis,
    nx: usize,
    ny: usize,
    nz: usize,
}

impl BevGrid {
    pub fn new(x: GridAxis, y: GridAxis, z: GridAxis) -> Result<Self, BevError> {
        Ok(Self {
            nx: x.cell_count()?,
            ny: y.cell_count()?,
            nz: z.cell_count()?,
            x,
            y,
            z,
        })
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    pub fn nz(&self) -> usize {
        self.nz
    }

    /// Total number of voxels.
    pub fn cells(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    /// Flattened voxel rank `iz * (ny * nx) + iy * nx + ix` of an ego-frame
    /// point, or `None` when the point lies outside the grid.
    pub fn rank_of(&self, x: f32, y: f32, z: f32) -> Option<usize> {
        let ix = self.x.cell_of(x, self.nx)?;
        let iy = self.y.cell_of(y, self.ny)?;
        let iz = self.z.cell_of(z, self.nz)?;
        Some(iz * self.ny * self.nx + iy * self.nx + ix)
    }
}
