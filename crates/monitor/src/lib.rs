//! Metric histories, baselines, and the statistical anomaly detector.
//!
//! The detector owns its stores outright: all state changes happen inside
//! one worker, and other components only ever see the notifications it
//! pushes onto the alert bus.

pub mod baseline_store;
pub mod detector;
pub mod store;

pub use baseline_store::BaselineStore;
pub use detector::{AnomalyDetector, DetectorConfig, DetectorPhase};
pub use store::MetricStore;
