//! # tether-console
//!
//! Operator console shell around `tether-core`. Streams controller
//! samples up to the vehicle, monitors the telemetry bus coming back,
//! sends control commands and supervises the video pipelines.

pub mod config;
pub mod watchdog;
