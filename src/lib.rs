//! # Zehnder RF Library
//!
//! Pair with and control a Zehnder-style ventilation unit over its
//! proprietary 16-byte RF protocol.
//!
//! The protocol engines are sans-IO: [`fan::FanController`] and
//! [`link::LinkEngine`] never block, never sleep and never spawn. The host
//! drives them with timestamps and forwards radio notifications, and the
//! radio itself sits behind [`link::radio::RadioDriver`].

pub mod config;
pub mod error;
pub mod fan;
pub mod frame;
pub mod link;
pub mod serial;
pub mod session;
pub mod telemetry;
