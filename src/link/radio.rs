//! Trait abstraction for the RF transceiver to enable testing

use crate::error::Result;
use crate::frame::FRAME_SIZE;

/// Operations the link layer needs from the half-duplex transceiver
///
/// Transmit-complete and receive notifications are not callbacks: the host
/// forwards them into the engine from its own event loop, so the driver never
/// re-enters the engine.
pub trait RadioDriver {
    /// Load a frame into the transmit buffer without sending it
    fn load_payload(&mut self, frame: &[u8; FRAME_SIZE]) -> Result<()>;

    /// Whether another transmission currently occupies the airway
    fn channel_busy(&mut self) -> bool;

    /// Send the loaded frame `repeats` times back to back, then listen
    fn start_transmit(&mut self, repeats: u8) -> Result<()>;

    /// Point both the receive and transmit address at `network_id`
    fn set_channel_address(&mut self, network_id: u32) -> Result<()>;
}
