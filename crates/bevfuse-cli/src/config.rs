//! Pipeline file loading – reads `~/.bevfuse/pipeline.toml` or an explicit
//! path.
//!
//! A pipeline file holds the detector parameters under `[detector]` and one
//! `[[cameras]]` entry per camera, in rig order:
//!
//! ```toml
//! [detector]
//! n_img = 1
//! adj_num = 4
//!
//! [[cameras]]
//! name = "CAM_FRONT"
//! intrinsic = [[1266.4, 0.0, 816.3], [0.0, 1266.4, 491.5], [0.0, 0.0, 1.0]]
//! sensor2ego_rotation = [0.5, -0.5, 0.5, -0.5]
//! sensor2ego_translation = [1.70, 0.02, 1.51]
//! ```

use bevfuse_runtime::BevDetConfig;
use bevfuse_types::CameraCalibration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Parsed pipeline file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineFile {
    #[serde(default)]
    pub detector: BevDetConfig,
    #[serde(default)]
    pub cameras: Vec<CameraCalibration>,
}

/// Return the path to `~/.bevfuse/pipeline.toml`.
pub fn default_path() -> PathBuf {
    path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".bevfuse").join("pipeline.toml")
}

/// Load `path`, or the default location when `None`.
///
/// A missing file is an error here: the detector cannot run without a rig.
pub fn load(path: Option<&Path>) -> Result<PipelineFile, String> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_path);
    load_from(&path)?.ok_or_else(|| format!("No pipeline file at {}", path.display()))
}

/// Load a specific path.  Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<PipelineFile>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read pipeline file at {}: {}", path.display(), e))?;
    let mut file: PipelineFile =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse pipeline file: {}", e))?;
    apply_env_overrides(&mut file.detector);
    Ok(Some(file))
}

/// Apply `BEVFUSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `BEVFUSE_SCORE_THRESH` | `score_thresh` |
/// | `BEVFUSE_NMS_THRESH` | `nms_overlap_thresh` |
/// | `BEVFUSE_ADJ_NUM` | `adj_num` |
/// | `BEVFUSE_USE_ADJ` | `use_adj` (`true`/`false`/`1`/`0`) |
///
/// Unparsable values are ignored.
pub fn apply_env_overrides(cfg: &mut BevDetConfig) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides_from(cfg: &mut BevDetConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("BEVFUSE_SCORE_THRESH")
        && let Ok(t) = v.trim().parse::<f32>()
    {
        cfg.score_thresh = t;
    }
    if let Some(v) = var("BEVFUSE_NMS_THRESH")
        && let Ok(t) = v.trim().parse::<f32>()
    {
        cfg.nms_overlap_thresh = t;
    }
    if let Some(v) = var("BEVFUSE_ADJ_NUM")
        && let Ok(n) = v.trim().parse::<usize>()
    {
        cfg.adj_num = n;
    }
    if let Some(v) = var("BEVFUSE_USE_ADJ")
        && let Some(b) = parse_bool(&v)
    {
        cfg.use_adj = b;
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const PIPELINE: &str = r#"
        [detector]
        n_img = 1
        adj_num = 3
        input_img_h = 3
        input_img_w = 3
        down_sample = 1

        [[cameras]]
        name = "CAM_FRONT"
        intrinsic = [[1.0, 0.0, 1.0], [0.0, 1.0, 1.0], [0.0, 0.0, 1.0]]
        sensor2ego_rotation = [0.5, -0.5, 0.5, -0.5]
        sensor2ego_translation = [0.0, 0.0, 0.0]
    "#;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_path_points_to_bevfuse_dir() {
        let p = path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".bevfuse"));
        assert!(p.to_string_lossy().ends_with("pipeline.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
        assert!(load(Some(&path)).is_err());
    }

    #[test]
    fn loads_detector_and_cameras() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("pipeline.toml");
        fs::write(&path, PIPELINE).expect("write");

        let file = load(Some(&path)).expect("load");
        assert_eq!(file.detector.n_img, 1);
        assert_eq!(file.detector.input_img_w, 3);
        assert_eq!(file.detector.nms_pre_maxnum, 1000);
        assert_eq!(file.cameras.len(), 1);
        assert_eq!(file.cameras[0].name, "CAM_FRONT");
        assert_eq!(file.cameras[0].intrinsic[0][2], 1.0);
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("pipeline.toml");
        fs::write(&path, "[detector]\nn_img = \"six\"\n").expect("write");
        let err = load(Some(&path)).unwrap_err();
        assert!(err.starts_with("Failed to parse pipeline file"));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("pipeline.toml");
        fs::write(&path, "").expect("write");
        let file = load(Some(&path)).expect("load");
        assert!(file.cameras.is_empty());
        assert_eq!(file.detector.n_img, 6);
    }

    #[test]
    fn overrides_apply_to_each_field() {
        let mut cfg = BevDetConfig::default();
        apply_overrides_from(
            &mut cfg,
            vars(&[
                ("BEVFUSE_SCORE_THRESH", "0.35"),
                ("BEVFUSE_NMS_THRESH", " 0.5 "),
                ("BEVFUSE_ADJ_NUM", "2"),
                ("BEVFUSE_USE_ADJ", "off"),
            ]),
        );
        assert_eq!(cfg.score_thresh, 0.35);
        assert_eq!(cfg.nms_overlap_thresh, 0.5);
        assert_eq!(cfg.adj_num, 2);
        assert!(!cfg.use_adj);
    }

    #[test]
    fn overrides_ignore_invalid_values() {
        let mut cfg = BevDetConfig::default();
        let original = cfg.clone();
        apply_overrides_from(
            &mut cfg,
            vars(&[
                ("BEVFUSE_SCORE_THRESH", "high"),
                ("BEVFUSE_ADJ_NUM", "-1"),
                ("BEVFUSE_USE_ADJ", "maybe"),
            ]),
        );
        assert_eq!(cfg, original);
    }

    #[test]
    fn apply_env_overrides_reads_process_environment() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("BEVFUSE_ADJ_NUM", "5") };
        let mut cfg = BevDetConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.adj_num, 5);
        unsafe { std::env::remove_var("BEVFUSE_ADJ_NUM") };
    }
}
