use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single 3-D detection produced by the postprocessor.
///
/// Boxes are expressed in the ego frame.  They carry no identity across
/// frames; tracking happens further down the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box3D {
    /// Box centre (x, y, z) in metres.
    pub center: [f32; 3],
    /// Box extent (length along x, width along y, height along z) in metres.
    pub size: [f32; 3],
    /// Heading around +Z, counter-clockwise from +X (radians).
    pub yaw: f32,
    /// Planar velocity (vx, vy) in m/s, when the task head regresses it.
    pub velocity: Option<[f32; 2]>,
    /// Global class index (task offset + local label).
    pub class_id: usize,
    /// Detection confidence in `[0, 1]` for sigmoid-activated heads.
    pub score: f32,
}

/// Calibration of one camera as it arrives from the configuration layer.
///
/// Values are raw: the rotation quaternion is validated and renormalised when
/// it is turned into a pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    /// Camera name, e.g. `"CAM_FRONT"`.
    pub name: String,
    /// Row-major 3×3 pinhole intrinsic matrix.
    pub intrinsic: [[f32; 3]; 3],
    /// Camera → ego rotation as `[w, x, y, z]`.
    pub sensor2ego_rotation: [f32; 4],
    /// Camera → ego translation in metres.
    pub sensor2ego_translation: [f32; 3],
}

/// Global error type for the BEV fusion and detection pipeline.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BevError {
    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Camera Count Mismatch: expected {expected} cameras, got {actual}")]
    CameraCountMismatch { expected: usize, actual: usize },

    #[error("Malformed Pose: {0}")]
    MalformedPose(String),

    #[error("Index Out Of Range: {index} (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Allocation Failed: could not reserve {bytes} bytes")]
    Allocation { bytes: usize },

    #[error("Tensor Shape Mismatch on {name}: expected {expected} elements, got {actual}")]
    TensorShape {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Inference Engine Error: {0}")]
    Engine(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box3d_serialization_roundtrip() {
        let b = Box3D {
            center: [10.0, -2.5, 0.8],
            size: [4.2, 1.9, 1.6],
            yaw: 0.3,
            velocity: Some([5.0, 0.1]),
            class_id: 0,
            score: 0.87,
        };
        let json = serde_json::to_string(&b).unwrap();
        let back: Box3D = serde_json::from_str(&json).unwrap();
        assert_eq!(b, back);
    }

    #[test]
    fn box3d_without_velocity_serializes_null() {
        let b = Box3D {
            center: [0.0; 3],
            size: [1.0; 3],
            yaw: 0.0,
            velocity: None,
            class_id: 8,
            score: 0.5,
        };
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"velocity\":null"));
    }

    #[test]
    fn camera_calibration_deserializes_from_json() {
        let raw = r#"{
            "name": "CAM_FRONT",
            "intrinsic": [[1266.4, 0.0, 816.3], [0.0, 1266.4, 491.5], [0.0, 0.0, 1.0]],
            "sensor2ego_rotation": [0.5, -0.5, 0.5, -0.5],
            "sensor2ego_translation": [1.7, 0.0, 1.5]
        }"#;
        let cam: CameraCalibration = serde_json::from_str(raw).unwrap();
        assert_eq!(cam.name, "CAM_FRONT");
        assert!((cam.intrinsic[0][2] - 816.3).abs() < 1e-3);
    }

    #[test]
    fn bev_error_display() {
        let err = BevError::CameraCountMismatch {
            expected: 6,
            actual: 5,
        };
        assert!(err.to_string().contains("expected 6"));

        let err2 = BevError::TensorShape {
            name: "heatmap".to_string(),
            expected: 100,
            actual: 99,
        };
        assert!(err2.to_string().contains("heatmap"));
        assert!(BevError::MalformedPose("zero norm".into())
            .to_string()
            .contains("Malformed Pose"));
    }
}
