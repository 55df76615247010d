//! # Error Types
//!
//! Custom error types for Zehnder RF using `thiserror`.

use thiserror::Error;

/// Main error type for Zehnder RF
#[derive(Debug, Error)]
pub enum ZehnderError {
    /// A transmit was requested while a link cycle is still in flight
    #[error("link busy: a transmit cycle is already in flight")]
    Busy,

    /// Received fewer bytes than a full frame
    #[error("malformed frame: expected {expected} bytes, got {actual}")]
    MalformedFrame { expected: usize, actual: usize },

    /// Well-formed frame that is not addressed to/from the expected parties
    #[error(
        "address mismatch: command 0x{command:02X} from type 0x{tx_type:02X} id 0x{tx_id:02X} \
         to type 0x{rx_type:02X} id 0x{rx_id:02X}"
    )]
    AddressMismatch {
        command: u8,
        rx_type: u8,
        rx_id: u8,
        tx_type: u8,
        tx_id: u8,
    },

    /// The airway never became free within the channel-access bound
    #[error("airway too busy, channel access timed out")]
    ChannelAccessTimeout,

    /// The radio never reported the loaded frame as sent
    #[error("transmission never completed")]
    TransmitTimeout,

    /// All retries were consumed without a matching reply
    #[error("no reply received, retries exhausted")]
    ReplyExhausted,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Pairing storage (de)serialization errors
    #[error("Storage error: {0}")]
    Storage(#[from] serde_json::Error),

    /// Serial bridge framing errors
    #[error("Bridge protocol error: {0}")]
    Bridge(String),

    /// Serial port errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// No serial device could be opened
    #[error("No serial bridge found (tried: {0})")]
    SerialPortNotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Zehnder RF
pub type Result<T> = std::result::Result<T, ZehnderError>;
