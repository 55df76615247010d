//! Radio driver backed by the serial bridge

use std::collections::VecDeque;

use super::protocol::{BridgeCommand, BridgeEvent};
use crate::error::Result;
use crate::frame::FRAME_SIZE;
use crate::link::radio::RadioDriver;

/// `RadioDriver` that turns every call into a bridge command
///
/// The engine runs synchronously, so commands are queued here and the host
/// writes them to the port after each engine call. The airway state is the
/// last `Carrier` event the bridge reported.
#[derive(Debug, Default)]
pub struct BridgeRadio {
    outbound: VecDeque<BridgeCommand>,
    carrier: bool,
}

impl BridgeRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track state carried by a bridge event
    pub fn handle_event(&mut self, event: &BridgeEvent) {
        if let BridgeEvent::Carrier(busy) = event {
            self.carrier = *busy;
        }
    }

    /// Commands queued since the last call, oldest first
    pub fn take_outbound(&mut self) -> Vec<BridgeCommand> {
        self.outbound.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }
}

impl RadioDriver for BridgeRadio {
    fn load_payload(&mut self, frame: &[u8; FRAME_SIZE]) -> Result<()> {
        self.outbound.push_back(BridgeCommand::LoadPayload(*frame));
        Ok(())
    }

    fn channel_busy(&mut self) -> bool {
        self.carrier
    }

    fn start_transmit(&mut self, repeats: u8) -> Result<()> {
        self.outbound.push_back(BridgeCommand::StartTx { repeats });
        Ok(())
    }

    fn set_channel_address(&mut self, network_id: u32) -> Result<()> {
        self.outbound.push_back(BridgeCommand::SetAddress(network_id));
        Ok(())
    }
}
