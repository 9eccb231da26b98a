//! `bevfuse-runtime` – the per-frame detection loop.
//!
//! # Modules
//!
//! - [`config`] – [`BevDetConfig`][config::BevDetConfig]: serde-backed
//!   detector parameters with defaults and validation.
//! - [`engine`] – [`InferenceEngine`][engine::InferenceEngine]: the opaque
//!   network boundary, with its [`EngineInputs`][engine::EngineInputs] and
//!   pre-allocated [`EngineOutputs`][engine::EngineOutputs].
//! - [`orchestrator`] – [`BevDetector`][orchestrator::BevDetector]: owns all
//!   buffers, drives history, alignment, the engine and postprocessing for
//!   each [`FrameObservation`][orchestrator::FrameObservation].
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP export.

pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod telemetry;

pub use config::BevDetConfig;
pub use engine::{CAMERA_PARAM_LEN, EngineInputs, EngineOutputs, History, InferenceEngine};
pub use orchestrator::{BevDetector, FrameObservation, InferenceResult};
pub use telemetry::{TracerProviderGuard, init_tracing};
