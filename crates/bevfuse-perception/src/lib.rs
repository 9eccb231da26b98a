//! `bevfuse-perception` – geometry and tensor bookkeeping around a BEV
//! detection network.
//!
//! Everything here is pure host-side computation; the network itself lives
//! behind the engine trait in `bevfuse-runtime`.
//!
//! # Modules
//!
//! - [`transform`] – [`Quaternion`][transform::Quaternion],
//!   [`RigidTransform`][transform::RigidTransform] and the validated
//!   [`Pose`][transform::Pose] used for every ego → global input.
//! - [`grid`] – [`BevGrid`][grid::BevGrid]: voxel grid dimensions and the
//!   rank of a metric point.
//! - [`frame_buffer`] – [`FrameRingBuffer`][frame_buffer::FrameRingBuffer]:
//!   fixed-capacity history of BEV features with cold-start broadcast.
//! - [`pose_aligner`] – [`PoseAligner`][pose_aligner::PoseAligner]: grid
//!   sampling matrices that warp past features onto the current grid.
//! - [`view_transform`] –
//!   [`ViewTransformIndexer`][view_transform::ViewTransformIndexer]:
//!   precomputed image → BEV scatter tables and the reference
//!   [`bev_pool`][view_transform::bev_pool] reduction.
//! - [`iou`] – rotated bird's-eye-view IoU.
//! - [`postprocess`] –
//!   [`DetectionPostprocessor`][postprocess::DetectionPostprocessor]: decode,
//!   top-K and rotated NMS over task-head outputs.

pub mod frame_buffer;
pub mod grid;
pub mod iou;
pub mod pose_aligner;
pub mod postprocess;
pub mod transform;
pub mod view_transform;
