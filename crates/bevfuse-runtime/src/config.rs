//! Detector configuration.
//!
//! [`BevDetConfig`] is the already-parsed parameter set the detector runs
//! with.  Every field has a serde default matching a six-camera nuScenes
//! BEVDet deployment, so a config file only needs to name what it changes.

use bevfuse_perception::grid::{BevGrid, GridAxis};
use bevfuse_perception::postprocess::{DecodeContract, PostprocessConfig};
use bevfuse_perception::view_transform::{ImageAugmentation, ViewTransformParams};
use bevfuse_types::BevError;
use serde::{Deserialize, Serialize};

/// Bytes per BEV feature element (fp32).
pub const FEATURE_ELEMENT_BYTES: usize = std::mem::size_of::<f32>();

/// Detector parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BevDetConfig {
    /// Number of cameras in the rig.
    #[serde(default = "default_n_img")]
    pub n_img: usize,

    /// Network input height in pixels (after resize and crop).
    #[serde(default = "default_input_img_h")]
    pub input_img_h: usize,

    #[serde(default = "default_input_img_w")]
    pub input_img_w: usize,

    /// Image-backbone stride; the depth and feature maps are
    /// `input / down_sample`.
    #[serde(default = "default_down_sample")]
    pub down_sample: usize,

    /// Resize-then-crop applied to the raw images.
    #[serde(default = "default_augmentation")]
    pub augmentation: ImageAugmentation,

    /// Per-channel normalisation mean (RGB).
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],

    /// Per-channel normalisation standard deviation (RGB).
    #[serde(default = "default_std")]
    pub std: [f32; 3],

    #[serde(default = "default_depth")]
    pub depth: GridAxis,
    #[serde(default = "default_xy")]
    pub x: GridAxis,
    #[serde(default = "default_xy")]
    pub y: GridAxis,
    #[serde(default = "default_z")]
    pub z: GridAxis,

    /// Whether the engine consumes an explicit depth distribution.
    #[serde(default = "default_true")]
    pub use_depth: bool,

    /// Enable temporal fusion.
    #[serde(default = "default_true")]
    pub use_adj: bool,

    /// History frames fused with the current one.
    #[serde(default = "default_adj_num")]
    pub adj_num: usize,

    /// Channels of the BEV feature map stored per history frame.
    #[serde(default = "default_bev_channels")]
    pub bev_feature_channels: usize,

    /// Voxel cells per detection-head cell along x and y.
    #[serde(default = "default_out_size_factor")]
    pub out_size_factor: usize,

    /// Classes owned by each task head, in head order.
    #[serde(default = "default_class_num_per_task")]
    pub class_num_per_task: Vec<usize>,

    #[serde(default = "default_score_thresh")]
    pub score_thresh: f32,

    /// Optional per-class override of `score_thresh`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_score_thresh: Option<Vec<f32>>,

    #[serde(default = "default_nms_thresh")]
    pub nms_overlap_thresh: f32,

    #[serde(default = "default_nms_pre_maxnum")]
    pub nms_pre_maxnum: usize,

    #[serde(default = "default_nms_post_maxnum")]
    pub nms_post_maxnum: usize,

    #[serde(default = "default_nms_rescale_factor")]
    pub nms_rescale_factor: Vec<f32>,

    #[serde(default)]
    pub decode: DecodeContract,

    /// Heads emit a `vel` output.
    #[serde(default = "default_true")]
    pub with_velocity: bool,

    /// `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    #[serde(default = "default_post_center_range")]
    pub post_center_range: Option<[f32; 6]>,

    /// Apply `post_center_range`.  TOML has no null, so a pipeline file
    /// turns the filter off with `post_center_filter = false`.
    #[serde(default = "default_true")]
    pub post_center_filter: bool,
}

fn default_n_img() -> usize {
    6
}
fn default_input_img_h() -> usize {
    256
}
fn default_input_img_w() -> usize {
    704
}
fn default_down_sample() -> usize {
    16
}
fn default_augmentation() -> ImageAugmentation {
    // 1600 x 900 raw images resized to 704 wide, top cropped to 256 rows.
    ImageAugmentation {
        resize_ratio: 0.44,
        crop_h: 140.0,
        crop_w: 0.0,
    }
}
fn default_mean() -> [f32; 3] {
    [123.675, 116.28, 103.53]
}
fn default_std() -> [f32; 3] {
    [58.395, 57.12, 57.375]
}
fn default_depth() -> GridAxis {
    GridAxis::new(1.0, 60.0, 0.5)
}
fn default_xy() -> GridAxis {
    GridAxis::new(-51.2, 51.2, 0.8)
}
fn default_z() -> GridAxis {
    GridAxis::new(-5.0, 3.0, 8.0)
}
fn default_true() -> bool {
    true
}
fn default_adj_num() -> usize {
    8
}
fn default_bev_channels() -> usize {
    80
}
fn default_out_size_factor() -> usize {
    1
}
fn default_class_num_per_task() -> Vec<usize> {
    vec![1, 2, 2, 1, 2, 2]
}
fn default_score_thresh() -> f32 {
    0.1
}
fn default_nms_thresh() -> f32 {
    0.2
}
fn default_nms_pre_maxnum() -> usize {
    1000
}
fn default_nms_post_maxnum() -> usize {
    83
}
fn default_nms_rescale_factor() -> Vec<f32> {
    vec![1.0, 0.7, 0.7, 0.4, 0.55, 1.1, 1.0, 1.0, 1.5, 3.5]
}
fn default_post_center_range() -> Option<[f32; 6]> {
    Some([-61.2, -61.2, -10.0, 61.2, 61.2, 10.0])
}

impl Default for BevDetConfig {
    fn default() -> Self {
        Self {
            n_img: default_n_img(),
            input_img_h: default_input_img_h(),
            input_img_w: default_input_img_w(),
            down_sample: default_down_sample(),
            augmentation: default_augmentation(),
            mean: default_mean(),
            std: default_std(),
            depth: default_depth(),
            x: default_xy(),
            y: default_xy(),
            z: default_z(),
            use_depth: true,
            use_adj: true,
            adj_num: default_adj_num(),
            bev_feature_channels: default_bev_channels(),
            out_size_factor: default_out_size_factor(),
            class_num_per_task: default_class_num_per_task(),
            score_thresh: default_score_thresh(),
            class_score_thresh: None,
            nms_overlap_thresh: default_nms_thresh(),
            nms_pre_maxnum: default_nms_pre_maxnum(),
            nms_post_maxnum: default_nms_post_maxnum(),
            nms_rescale_factor: default_nms_rescale_factor(),
            decode: DecodeContract::default(),
            with_velocity: true,
            post_center_range: default_post_center_range(),
            post_center_filter: true,
        }
    }
}

impl BevDetConfig {
    /// Check every derived quantity the detector will rely on.
    ///
    /// # Errors
    ///
    /// Returns [`BevError::Config`] naming the first inconsistent field.
    pub fn validate(&self) -> Result<(), BevError> {
        if self.n_img == 0 {
            return Err(BevError::Config("n_img must be at least 1".into()));
        }
        if self.down_sample == 0
            || self.input_img_h % self.down_sample != 0
            || self.input_img_w % self.down_sample != 0
        {
            return Err(BevError::Config(format!(
                "input {}x{} is not divisible by down_sample {}",
                self.input_img_w, self.input_img_h, self.down_sample
            )));
        }
        if self.std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(BevError::Config(format!("std {:?} has a zero entry", self.std)));
        }
        if self.use_adj && self.adj_num == 0 {
            return Err(BevError::Config("use_adj requires adj_num >= 1".into()));
        }
        if self.bev_feature_channels == 0 {
            return Err(BevError::Config("bev_feature_channels must be non-zero".into()));
        }
        if self.class_num_per_task.is_empty() || self.class_num_per_task.contains(&0) {
            return Err(BevError::Config(format!(
                "class_num_per_task {:?} needs at least one class per task",
                self.class_num_per_task
            )));
        }
        let classes: usize = self.class_num_per_task.iter().sum();
        if self.nms_rescale_factor.len() != classes {
            return Err(BevError::Config(format!(
                "nms_rescale_factor has {} entries for {classes} classes",
                self.nms_rescale_factor.len()
            )));
        }

        let grid = self.grid()?;
        self.depth.cell_count()?;
        let osf = self.out_size_factor;
        if osf == 0 || grid.nx() % osf != 0 || grid.ny() % osf != 0 {
            return Err(BevError::Config(format!(
                "grid {}x{} is not divisible by out_size_factor {osf}",
                grid.nx(),
                grid.ny()
            )));
        }
        self.feature_bytes()?;
        Ok(())
    }

    pub fn grid(&self) -> Result<BevGrid, BevError> {
        BevGrid::new(self.x, self.y, self.z)
    }

    pub fn feat_h(&self) -> usize {
        self.input_img_h / self.down_sample.max(1)
    }

    pub fn feat_w(&self) -> usize {
        self.input_img_w / self.down_sample.max(1)
    }

    /// Bytes of one `[channels, ny, nx]` BEV feature map.
    pub fn feature_bytes(&self) -> Result<usize, BevError> {
        let grid = self.grid()?;
        (grid.nx() * grid.ny())
            .checked_mul(self.bev_feature_channels)
            .and_then(|n| n.checked_mul(FEATURE_ELEMENT_BYTES))
            .ok_or_else(|| BevError::Config("BEV feature size overflows usize".into()))
    }

    /// Bytes of one camera image at network input resolution (RGB, u8).
    pub fn image_bytes(&self) -> usize {
        self.input_img_h * self.input_img_w * 3
    }

    pub fn view_transform_params(&self) -> Result<ViewTransformParams, BevError> {
        Ok(ViewTransformParams {
            input_h: self.input_img_h,
            input_w: self.input_img_w,
            feat_h: self.feat_h(),
            feat_w: self.feat_w(),
            depth: self.depth,
            grid: self.grid()?,
            augmentation: self.augmentation,
        })
    }

    pub fn postprocess_config(&self) -> Result<PostprocessConfig, BevError> {
        let grid = self.grid()?;
        let osf = self.out_size_factor.max(1);
        Ok(PostprocessConfig {
            class_num_per_task: self.class_num_per_task.clone(),
            score_thresh: self.score_thresh,
            class_score_thresh: self.class_score_thresh.clone(),
            nms_overlap_thresh: self.nms_overlap_thresh,
            nms_pre_maxnum: self.nms_pre_maxnum,
            nms_post_maxnum: self.nms_post_maxnum,
            nms_rescale_factor: self.nms_rescale_factor.clone(),
            decode: self.decode,
            with_velocity: self.with_velocity,
            bev_h: grid.ny() / osf,
            bev_w: grid.nx() / osf,
            x: self.x,
            y: self.y,
            out_size_factor: osf as f32,
            post_center_range: self.post_center_range.filter(|_| self.post_center_filter),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = BevDetConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.grid().unwrap().nx(), 128);
        assert_eq!((cfg.feat_h(), cfg.feat_w()), (16, 44));
        assert_eq!(cfg.feature_bytes().unwrap(), 128 * 128 * 80 * 4);
        let pp = cfg.postprocess_config().unwrap();
        assert_eq!(pp.class_num(), cfg.nms_rescale_factor.len());
        assert_eq!((pp.bev_h, pp.bev_w), (128, 128));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: BevDetConfig = toml::from_str(
            r#"
            n_img = 1
            adj_num = 2
            score_thresh = 0.3

            [x]
            start = 0.0
            end = 4.0
            step = 1.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.n_img, 1);
        assert_eq!(cfg.adj_num, 2);
        assert_eq!(cfg.x, GridAxis::new(0.0, 4.0, 1.0));
        assert_eq!(cfg.y, default_xy());
        assert_eq!(cfg.nms_pre_maxnum, 1000);
        assert!(cfg.use_adj);
    }

    #[test]
    fn decode_contract_parses_from_toml() {
        let cfg: BevDetConfig = toml::from_str(
            r#"
            [decode]
            yaw = "angle"
            size = "linear"
            score = "identity"
            bottom_center = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.decode.rot_channels(), 1);
        assert!(cfg.decode.bottom_center);
    }

    #[test]
    fn post_center_filter_can_be_switched_off() {
        let on = BevDetConfig::default().postprocess_config().unwrap();
        assert_eq!(on.post_center_range, default_post_center_range());

        let cfg: BevDetConfig = toml::from_str("post_center_filter = false").unwrap();
        assert!(cfg.post_center_range.is_some());
        assert_eq!(cfg.postprocess_config().unwrap().post_center_range, None);
    }

    #[test]
    fn rejects_indivisible_input() {
        let cfg = BevDetConfig {
            input_img_h: 250,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(BevError::Config(_))));
    }

    #[test]
    fn rejects_zero_history_with_temporal_fusion() {
        let mut cfg = BevDetConfig {
            adj_num: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.use_adj = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_bad_grid_axis() {
        let cfg = BevDetConfig {
            x: GridAxis::new(0.0, 4.0, 0.0),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_size_factor_not_dividing_grid() {
        let cfg = BevDetConfig {
            out_size_factor: 3,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_rescale_factor_length_mismatch() {
        let cfg = BevDetConfig {
            class_num_per_task: vec![1, 2],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_std() {
        let cfg = BevDetConfig {
            std: [1.0, 0.0, 1.0],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
