//! # Frame Codec Module
//!
//! Implementation of the 16-byte Zehnder RF frame.
//!
//! This module handles:
//! - Protocol constants (device types, commands, speed presets)
//! - Encoding frames with command-specific payload variants
//! - Decoding received bytes, tolerant of inconsistent parameter counts

pub mod protocol;
pub mod encoder;
pub mod decoder;

pub use decoder::decode_frame;
pub use encoder::encode_frame;
pub use protocol::{DeviceAddress, Frame, Payload, FRAME_SIZE};
