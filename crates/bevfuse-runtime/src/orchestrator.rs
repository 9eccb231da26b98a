//! Per-frame detection driver.
//!
//! [`BevDetector`] owns every buffer the pipeline touches: view-transform
//! tables, the history ring, alignment matrices, the camera-parameter block
//! and the engine outputs.  They are all allocated in [`BevDetector::new`];
//! [`BevDetector::infer`] only overwrites them.
//!
//! One frame runs as follows:
//!
//! 1. Stage the camera parameters from the observation's calibration.
//! 2. With temporal fusion enabled, reset the history on a scene change and
//!    write one alignment matrix per history slot.
//! 3. Run the engine once.
//! 4. Store the engine's BEV feature as the newest history frame.
//! 5. Postprocess the head tensors into boxes.
//!
//! `infer` takes `&mut self`, so two frames can never be in flight against
//! the same detector.

use std::time::{Duration, Instant};

use bevfuse_perception::frame_buffer::FrameRingBuffer;
use bevfuse_perception::pose_aligner::PoseAligner;
use bevfuse_perception::postprocess::DetectionPostprocessor;
use bevfuse_perception::transform::Pose;
use bevfuse_perception::view_transform::{CameraGeometry, ViewTransformIndexer, ViewTransformTables};
use bevfuse_types::{BevError, Box3D, CameraCalibration};
use tracing::{debug, info};

use crate::config::BevDetConfig;
use crate::engine::{CAMERA_PARAM_LEN, EngineInputs, EngineOutputs, History, InferenceEngine};

// ────────────────────────────────────────────────────────────────────────────
// Per-frame contract
// ────────────────────────────────────────────────────────────────────────────

/// Everything observed at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameObservation {
    /// One RGB `u8` image per camera, already at network input resolution.
    pub images: Vec<Vec<u8>>,
    pub cameras: Vec<CameraCalibration>,
    /// Ego → global pose.
    pub ego2global: Pose,
    /// Identifies the recording; a change discards history.
    pub scene_token: String,
    /// Capture time in microseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    pub detections: Vec<Box3D>,
    /// Wall-clock time spent in [`BevDetector::infer`].
    pub elapsed: Duration,
    pub timestamp: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// BevDetector
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Temporal {
    ring: FrameRingBuffer,
    aligner: PoseAligner,
}

/// Temporal BEV detector around an external [`InferenceEngine`].
pub struct BevDetector<E: InferenceEngine> {
    config: BevDetConfig,
    tables: ViewTransformTables,
    postprocessor: DetectionPostprocessor,
    /// `None` when temporal fusion is disabled.
    temporal: Option<Temporal>,
    camera_params: Vec<f32>,
    outputs: EngineOutputs,
    engine: E,
}

impl<E: InferenceEngine> BevDetector<E> {
    /// Validate `config`, build the view-transform tables for `cameras` and
    /// allocate every per-frame buffer.
    ///
    /// # Errors
    ///
    /// - [`BevError::Config`] for an inconsistent configuration.
    /// - [`BevError::CameraCountMismatch`] when `cameras` does not match
    ///   `n_img`.
    /// - [`BevError::MalformedPose`] for a degenerate camera rotation.
    /// - [`BevError::Allocation`] when a buffer cannot be reserved.
    pub fn new(config: BevDetConfig, cameras: &[CameraCalibration], engine: E) -> Result<Self, BevError> {
        config.validate()?;
        if cameras.len() != config.n_img {
            return Err(BevError::CameraCountMismatch {
                expected: config.n_img,
                actual: cameras.len(),
            });
        }

        let geometries = cameras
            .iter()
            .map(CameraGeometry::from_calibration)
            .collect::<Result<Vec<_>, _>>()?;
        let tables = ViewTransformIndexer::new(config.view_transform_params()?, config.n_img)
            .build(&geometries)?;

        let postprocessor = DetectionPostprocessor::new(config.postprocess_config()?)?;
        let feature_bytes = config.feature_bytes()?;
        let outputs = EngineOutputs::allocate(feature_bytes, postprocessor.config())?;

        let temporal = if config.use_adj {
            Some(Temporal {
                ring: FrameRingBuffer::new(config.adj_num, feature_bytes)?,
                aligner: PoseAligner::new(config.adj_num, &config.grid()?),
            })
        } else {
            None
        };

        let mut detector = Self {
            camera_params: vec![0.0; config.n_img * CAMERA_PARAM_LEN],
            config,
            tables,
            postprocessor,
            temporal,
            outputs,
            engine,
        };
        detector.stage_camera_params(cameras)?;

        info!(
            cameras = detector.config.n_img,
            use_adj = detector.config.use_adj,
            adj_num = detector.config.adj_num,
            valid_samples = detector.tables.valid_count(),
            occupied_cells = detector.tables.unique_cells(),
            feature_bytes,
            "BEV detector initialised"
        );
        Ok(detector)
    }

    pub fn config(&self) -> &BevDetConfig {
        &self.config
    }

    pub fn tables(&self) -> &ViewTransformTables {
        &self.tables
    }

    /// Camera-parameter block as last staged.
    pub fn camera_params(&self) -> &[f32] {
        &self.camera_params
    }

    /// Stored history, when temporal fusion is enabled.
    pub fn history(&self) -> Option<&FrameRingBuffer> {
        self.temporal.as_ref().map(|t| &t.ring)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Run the full pipeline on one observation.
    ///
    /// # Errors
    ///
    /// - [`BevError::CameraCountMismatch`] / [`BevError::TensorShape`] when
    ///   the observation does not match the configured rig.
    /// - [`BevError::MalformedPose`] for a degenerate camera rotation.
    /// - Any error returned by the engine; history is left untouched in
    ///   that case.
    pub fn infer(&mut self, obs: &FrameObservation) -> Result<InferenceResult, BevError> {
        let start = Instant::now();

        self.check_images(obs)?;
        self.stage_camera_params(&obs.cameras)?;

        let history_valid = match self.temporal.as_mut() {
            Some(t) => prepare_history(t, obs)?,
            None => false,
        };

        let inputs = EngineInputs {
            images: &obs.images,
            mean: self.config.mean,
            std: self.config.std,
            use_depth: self.config.use_depth,
            camera_params: &self.camera_params,
            tables: &self.tables,
            history: self
                .temporal
                .as_ref()
                .map(|t| History::new(&t.ring, t.aligner.transforms(), history_valid)),
        };
        self.engine.infer(&inputs, &mut self.outputs)?;

        if let Some(t) = self.temporal.as_mut() {
            if t.ring.last_scene_token() != Some(obs.scene_token.as_str()) {
                if let Some(previous) = t.ring.last_scene_token() {
                    info!(from = previous, to = %obs.scene_token, "scene changed, history reset");
                }
                t.ring.reset();
            }
            t.ring
                .save(&self.outputs.bev_feature, &obs.scene_token, obs.ego2global)?;
        }

        let detections = self.postprocessor.process(&self.outputs.heads)?;
        let elapsed = start.elapsed();

        debug!(
            scene = %obs.scene_token,
            timestamp = obs.timestamp,
            history_valid,
            detections = detections.len(),
            elapsed_ms = elapsed.as_secs_f64() * 1e3,
            "frame inferred"
        );

        Ok(InferenceResult {
            detections,
            elapsed,
            timestamp: obs.timestamp,
        })
    }

    fn check_images(&self, obs: &FrameObservation) -> Result<(), BevError> {
        let n = self.config.n_img;
        for count in [obs.images.len(), obs.cameras.len()] {
            if count != n {
                return Err(BevError::CameraCountMismatch {
                    expected: n,
                    actual: count,
                });
            }
        }
        let expected = self.config.image_bytes();
        if let Some((i, img)) = obs.images.iter().enumerate().find(|(_, img)| img.len() != expected) {
            return Err(BevError::TensorShape {
                name: format!("image[{i}]"),
                expected,
                actual: img.len(),
            });
        }
        Ok(())
    }

    /// Refresh the camera-parameter block in place.
    ///
    /// Every calibration is validated before any block is written.
    fn stage_camera_params(&mut self, cameras: &[CameraCalibration]) -> Result<(), BevError> {
        let post_rot = self.config.augmentation.post_rot();
        let post_trans = self.config.augmentation.post_trans();

        let geometries = cameras
            .iter()
            .map(CameraGeometry::from_calibration)
            .collect::<Result<Vec<_>, _>>()?;

        for ((cal, geometry), block) in cameras
            .iter()
            .zip(&geometries)
            .zip(self.camera_params.chunks_exact_mut(CAMERA_PARAM_LEN))
        {
            let k = cal.intrinsic;
            let r = geometry.sensor2ego.rotation().to_matrix().m;
            let t = geometry.sensor2ego.translation();
            block.copy_from_slice(&[
                k[0][0],
                k[1][1],
                k[0][2],
                k[1][2],
                post_rot[0][0],
                post_rot[0][1],
                post_trans[0],
                post_rot[1][0],
                post_rot[1][1],
                post_trans[1],
                r[0][0],
                r[0][1],
                r[0][2],
                t.x,
                r[1][0],
                r[1][1],
                r[1][2],
                t.y,
                r[2][0],
                r[2][1],
                r[2][2],
                t.z,
            ]);
        }
        Ok(())
    }
}

/// Align every slot to the current pose.
///
/// Returns whether the stored history belongs to the current scene.  Slots
/// from another scene, or not yet filled, get the identity alignment.  The
/// ring itself is only reset once the engine has succeeded.  The current
/// frame is not yet stored, so slot `k` is the frame `k + 1` frames back.
fn prepare_history(t: &mut Temporal, obs: &FrameObservation) -> Result<bool, BevError> {
    let same_scene = t.ring.last_scene_token() == Some(obs.scene_token.as_str());

    for k in 0..t.aligner.slots() {
        let past = if same_scene && t.ring.has_frame(k) {
            t.ring.lookup(k)?.pose
        } else {
            obs.ego2global
        };
        t.aligner.align(k, &obs.ego2global, &past)?;
    }
    Ok(same_scene && t.ring.has_frame(0))
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
