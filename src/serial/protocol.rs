//! Wire format between the host and the USB-serial radio bridge
//!
//! Every message is `[SYNC][kind][len][payload...]`.
//!
//! | Kind | Direction | Payload |
//! |------|-----------|---------|
//! | `0x01` LoadPayload | host → bridge | 16-byte RF frame |
//! | `0x02` StartTx | host → bridge | repeat count |
//! | `0x03` SetAddress | host → bridge | network id, u32 LE |
//! | `0x81` Carrier | bridge → host | 0 = airway free, 1 = busy |
//! | `0x82` TxDone | bridge → host | none |
//! | `0x83` Received | bridge → host | raw RF frame bytes |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::frame::FRAME_SIZE;

/// Start of every bridge message
pub const BRIDGE_SYNC: u8 = 0x7E;

/// Sync, kind and length
pub const BRIDGE_HEADER_SIZE: usize = 3;

/// Longest `Received` payload the bridge forwards
pub const MAX_RECEIVED_LEN: usize = 64;

pub mod kind {
    pub const LOAD_PAYLOAD: u8 = 0x01;
    pub const START_TX: u8 = 0x02;
    pub const SET_ADDRESS: u8 = 0x03;
    pub const CARRIER: u8 = 0x81;
    pub const TX_DONE: u8 = 0x82;
    pub const RECEIVED: u8 = 0x83;
}

/// Host → bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeCommand {
    LoadPayload([u8; FRAME_SIZE]),
    StartTx { repeats: u8 },
    SetAddress(u32),
}

impl BridgeCommand {
    pub fn kind(&self) -> u8 {
        match self {
            BridgeCommand::LoadPayload(_) => kind::LOAD_PAYLOAD,
            BridgeCommand::StartTx { .. } => kind::START_TX,
            BridgeCommand::SetAddress(_) => kind::SET_ADDRESS,
        }
    }

    /// Encode into a complete bridge message
    ///
    /// # Examples
    ///
    /// ```
    /// use zehnder_rf::serial::protocol::BridgeCommand;
    ///
    /// let message = BridgeCommand::StartTx { repeats: 4 }.encode();
    /// assert_eq!(&message[..], &[0x7E, 0x02, 0x01, 0x04]);
    /// ```
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BRIDGE_HEADER_SIZE + FRAME_SIZE);
        buf.put_u8(BRIDGE_SYNC);
        buf.put_u8(self.kind());

        match self {
            BridgeCommand::LoadPayload(frame) => {
                buf.put_u8(FRAME_SIZE as u8);
                buf.put_slice(frame);
            }
            BridgeCommand::StartTx { repeats } => {
                buf.put_u8(1);
                buf.put_u8(*repeats);
            }
            BridgeCommand::SetAddress(network_id) => {
                buf.put_u8(4);
                buf.put_u32_le(*network_id);
            }
        }

        buf.freeze()
    }
}

/// Bridge → host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Airway state changed
    Carrier(bool),
    /// The loaded frame has been sent
    TxDone,
    /// A frame arrived on the current address
    Received(Bytes),
}

/// Incremental decoder for the bridge byte stream
///
/// Bytes before a sync byte are dropped. A header with an unknown kind or an
/// impossible length drops only its sync byte, so a real message that starts
/// inside it is still found.
#[derive(Debug, Default)]
pub struct BridgeDecoder {
    buf: BytesMut,
}

impl BridgeDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the port
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes waiting for the rest of a message
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete event, if one is buffered
    pub fn next_event(&mut self) -> Option<BridgeEvent> {
        loop {
            let start = self.buf.iter().position(|&b| b == BRIDGE_SYNC);
            match start {
                Some(0) => {}
                Some(skip) => {
                    debug!("Bridge: dropping {} bytes before sync", skip);
                    self.buf.advance(skip);
                }
                None => {
                    if !self.buf.is_empty() {
                        debug!("Bridge: dropping {} bytes without sync", self.buf.len());
                        self.buf.clear();
                    }
                    return None;
                }
            }

            if self.buf.len() < BRIDGE_HEADER_SIZE {
                return None;
            }

            let kind = self.buf[1];
            let len = self.buf[2] as usize;
            let valid = match kind {
                kind::CARRIER => len == 1,
                kind::TX_DONE => len == 0,
                kind::RECEIVED => len <= MAX_RECEIVED_LEN,
                _ => false,
            };
            if !valid {
                trace!("Bridge: bad header kind 0x{:02X} len {}, resyncing", kind, len);
                self.buf.advance(1);
                continue;
            }

            if self.buf.len() < BRIDGE_HEADER_SIZE + len {
                return None;
            }

            self.buf.advance(BRIDGE_HEADER_SIZE);
            let payload = self.buf.split_to(len).freeze();

            return Some(match kind {
                kind::CARRIER => BridgeEvent::Carrier(payload[0] != 0),
                kind::TX_DONE => BridgeEvent::TxDone,
                _ => BridgeEvent::Received(payload),
            });
        }
    }
}
