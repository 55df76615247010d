//! # Telemetry Module
//!
//! Handles telemetry logging to JSONL files with rotation.
//!
//! This module handles:
//! - Recording published fan states and sensor readings
//! - Formatting as JSONL (JSON Lines) with RFC 3339 timestamps
//! - Writing to rotating log files (max N records per file)
//! - Retaining only the last M files

pub mod logger;

pub use logger::TelemetryLogger;
