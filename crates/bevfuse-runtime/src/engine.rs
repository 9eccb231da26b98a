//! Boundary to the external inference engine.
//!
//! The detector never looks inside the network.  Once per frame it hands an
//! [`EngineInputs`] bundle to an [`InferenceEngine`] and reads back the
//! pre-allocated [`EngineOutputs`]: the current frame's BEV feature (stored
//! into history) and the raw task-head tensors (postprocessed).

use bevfuse_perception::frame_buffer::FrameRingBuffer;
use bevfuse_perception::pose_aligner::TRANSFORM_LEN;
use bevfuse_perception::postprocess::{PostprocessConfig, TaskHeadTensors};
use bevfuse_perception::view_transform::ViewTransformTables;
use bevfuse_types::BevError;

/// Floats per camera in the camera-parameter block.
///
/// `fx, fy, cx, cy`, the image augmentation as
/// `post_rot00, post_rot01, post_trans_x, post_rot10, post_rot11, post_trans_y`,
/// then the row-major 3×4 camera → ego matrix `[R | t]`.
pub const CAMERA_PARAM_LEN: usize = 22;

/// An opaque network runner: images and history in, BEV feature and head
/// tensors out.
///
/// Implementations must fill every output buffer in place and must not
/// resize them.
pub trait InferenceEngine: Send {
    fn infer(&mut self, inputs: &EngineInputs<'_>, outputs: &mut EngineOutputs) -> Result<(), BevError>;
}

/// History handed to the engine when temporal fusion is enabled.
#[derive(Debug, Clone, Copy)]
pub struct History<'a> {
    ring: &'a FrameRingBuffer,
    transforms: &'a [f32],
    /// `false` on the first frame of a scene: every slot then holds zeros
    /// or frames of an earlier scene and must not be fused.
    pub valid: bool,
}

impl<'a> History<'a> {
    pub(crate) fn new(ring: &'a FrameRingBuffer, transforms: &'a [f32], valid: bool) -> Self {
        Self {
            ring,
            transforms,
            valid,
        }
    }

    /// Number of history slots.
    pub fn len(&self) -> usize {
        self.transforms.len() / TRANSFORM_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feature of the frame `k + 1` frames before the current one.
    pub fn feature(&self, k: usize) -> Option<&'a [u8]> {
        if k >= self.len() {
            return None;
        }
        self.ring.lookup(k).ok().map(|view| view.feature)
    }

    /// Row-major 3×3 sampling matrix warping slot `k` onto the current grid.
    pub fn transform(&self, k: usize) -> Option<&'a [f32]> {
        let offset = k * TRANSFORM_LEN;
        self.transforms.get(offset..offset + TRANSFORM_LEN)
    }

    /// All slot matrices back to back.
    pub fn transforms(&self) -> &'a [f32] {
        self.transforms
    }
}

/// Everything the engine reads for one frame.
#[derive(Debug, Clone, Copy)]
pub struct EngineInputs<'a> {
    /// One RGB `u8` image per camera at network input resolution.
    pub images: &'a [Vec<u8>],
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub use_depth: bool,
    /// [`CAMERA_PARAM_LEN`] floats per camera.
    pub camera_params: &'a [f32],
    pub tables: &'a ViewTransformTables,
    /// `None` when temporal fusion is disabled.
    pub history: Option<History<'a>>,
}

/// Output buffers, allocated once and overwritten by every call.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutputs {
    /// Current frame's `[channels, ny, nx]` fp32 BEV feature as raw bytes.
    pub bev_feature: Vec<u8>,
    /// Raw outputs per task head.
    pub heads: Vec<TaskHeadTensors>,
}

impl EngineOutputs {
    /// Zero-filled buffers for `feature_bytes` of BEV feature and the heads
    /// described by `config`.
    pub fn allocate(feature_bytes: usize, config: &PostprocessConfig) -> Result<Self, BevError> {
        let mut bev_feature = Vec::new();
        bev_feature
            .try_reserve_exact(feature_bytes)
            .map_err(|_| BevError::Allocation {
                bytes: feature_bytes,
            })?;
        bev_feature.resize(feature_bytes, 0);

        let heads = (0..config.class_num_per_task.len())
            .map(|task| TaskHeadTensors::zeros(config, task))
            .collect();

        Ok(Self { bev_feature, heads })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevfuse_perception::grid::GridAxis;
    use bevfuse_perception::postprocess::DecodeContract;
    use bevfuse_perception::transform::Pose;

    fn pp_config() -> PostprocessConfig {
        PostprocessConfig {
            class_num_per_task: vec![1, 2],
            score_thresh: 0.1,
            class_score_thresh: None,
            nms_overlap_thresh: 0.2,
            nms_pre_maxnum: 10,
            nms_post_maxnum: 10,
            nms_rescale_factor: vec![1.0; 3],
            decode: DecodeContract::default(),
            with_velocity: true,
            bev_h: 2,
            bev_w: 3,
            x: GridAxis::new(0.0, 3.0, 1.0),
            y: GridAxis::new(0.0, 2.0, 1.0),
            out_size_factor: 1.0,
            post_center_range: None,
        }
    }

    #[test]
    fn outputs_are_sized_from_config() {
        let out = EngineOutputs::allocate(64, &pp_config()).unwrap();
        assert_eq!(out.bev_feature.len(), 64);
        assert_eq!(out.heads.len(), 2);
        assert_eq!(out.heads[1].heatmap.len(), 2 * 6);
        assert_eq!(out.heads[0].rot.len(), 2 * 6);
        assert_eq!(out.heads[0].vel.as_ref().map(Vec::len), Some(12));
    }

    #[test]
    fn history_exposes_slots() {
        let mut ring = FrameRingBuffer::new(2, 4).unwrap();
        ring.save(&[1; 4], "a", Pose::identity()).unwrap();
        ring.save(&[2; 4], "a", Pose::identity()).unwrap();
        let transforms = [0.5f32; 2 * TRANSFORM_LEN];

        let history = History::new(&ring, &transforms, true);
        assert_eq!(history.len(), 2);
        assert_eq!(history.feature(0), Some(&[2u8; 4][..]));
        assert_eq!(history.feature(1), Some(&[1u8; 4][..]));
        assert_eq!(history.feature(2), None);
        assert_eq!(history.transform(1).map(<[f32]>::len), Some(TRANSFORM_LEN));
        assert!(history.transform(2).is_none());
    }
}
