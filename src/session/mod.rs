//! # Session Module
//!
//! Pairing result shared with the main unit, and its persistence.

pub mod store;

use serde::{Deserialize, Serialize};

use crate::frame::protocol::DeviceAddress;

/// Network id and the identities of both ends of the link
///
/// Either every field holds the value agreed during pairing, or the session
/// is unpaired and discovery has to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub network_id: u32,
    pub my_device_type: u8,
    pub my_device_id: u8,
    pub main_unit_type: u8,
    pub main_unit_id: u8,
}

impl SessionConfig {
    /// True when all five fields are non-zero
    pub fn is_paired(&self) -> bool {
        self.network_id != 0
            && self.my_device_type != 0
            && self.my_device_id != 0
            && self.main_unit_type != 0
            && self.main_unit_id != 0
    }

    /// Our own address on the network
    pub fn local(&self) -> DeviceAddress {
        DeviceAddress::new(self.my_device_type, self.my_device_id)
    }

    /// The paired main unit
    pub fn peer(&self) -> DeviceAddress {
        DeviceAddress::new(self.main_unit_type, self.main_unit_id)
    }
}
