//! # Zehnder RF Protocol Constants and Types
//!
//! Core definitions for the 16-byte over-the-air frame.
//!
//! ```text
//! Offset  Field
//! 0x00    rx_type
//! 0x01    rx_id
//! 0x02    tx_type
//! 0x03    tx_id
//! 0x04    ttl
//! 0x05    command
//! 0x06    parameter_count
//! 0x07..  payload (9 bytes, zero padded)
//! ```

/// Every frame is exactly 16 bytes on air
pub const FRAME_SIZE: usize = 16;

/// Header bytes preceding the payload
pub const FRAME_HEADER_SIZE: usize = 7;

/// Payload area size (16 frame - 7 header)
pub const FRAME_PAYLOAD_SIZE: usize = FRAME_SIZE - FRAME_HEADER_SIZE;

/// Default time-to-live for a frame (0xFA)
pub const DEFAULT_TTL: u8 = 250;

/// Radio address used while looking for a main unit to pair with
pub const NETWORK_LINK_ID: u32 = 0xA55A_5AA5;

/// Device types
pub mod device_type {
    /// Broadcast to all devices
    pub const BROADCAST: u8 = 0x00;
    /// Ventilation main unit
    pub const MAIN_UNIT: u8 = 0x01;
    /// Remote controls (our role)
    pub const REMOTE_CONTROL: u8 = 0x03;
    /// CO2 sensors
    pub const CO2_SENSOR: u8 = 0x18;
}

/// Command codes
pub mod command {
    /// Set speed as voltage percentage
    pub const SET_VOLTAGE: u8 = 0x01;
    /// Set speed preset
    pub const SET_SPEED: u8 = 0x02;
    /// Set speed preset with timer
    pub const SET_TIMER: u8 = 0x03;
    pub const JOIN_REQUEST: u8 = 0x04;
    pub const SET_SPEED_REPLY: u8 = 0x05;
    pub const JOIN_OPEN: u8 = 0x06;
    /// Current settings, sent by the main unit in reply to a query
    pub const FAN_SETTINGS: u8 = 0x07;
    pub const JOIN_SUCCESS: u8 = 0x0B;
    pub const JOIN_ACK: u8 = 0x0C;
    pub const QUERY_NETWORK: u8 = 0x0D;
    pub const QUERY_DEVICE: u8 = 0x10;
    pub const SET_VOLTAGE_REPLY: u8 = 0x1D;
}

/// Fan speed presets
pub mod speed {
    /// 0% / 0.0 V
    pub const AUTO: u8 = 0x00;
    /// 30% / 3.0 V
    pub const LOW: u8 = 0x01;
    /// 50% / 5.0 V
    pub const MEDIUM: u8 = 0x02;
    /// 90% / 9.0 V
    pub const HIGH: u8 = 0x03;
    /// 100% / 10.0 V
    pub const MAX: u8 = 0x04;
}

/// A device on the network, identified by type and id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddress {
    pub device_type: u8,
    pub id: u8,
}

impl DeviceAddress {
    pub const fn new(device_type: u8, id: u8) -> Self {
        Self { device_type, id }
    }

    /// Broadcast address (type 0x00, id 0x00)
    pub const fn broadcast() -> Self {
        Self::new(device_type::BROADCAST, 0x00)
    }
}

/// Uninterpreted parameter bytes for commands without a fixed layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawParams {
    len: u8,
    bytes: [u8; FRAME_PAYLOAD_SIZE],
}

impl RawParams {
    /// Copy up to 9 bytes; anything longer is truncated
    pub fn from_slice(data: &[u8]) -> Self {
        let len = data.len().min(FRAME_PAYLOAD_SIZE);
        let mut bytes = [0u8; FRAME_PAYLOAD_SIZE];
        bytes[..len].copy_from_slice(&data[..len]);
        Self {
            len: len as u8,
            bytes,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Command-specific payload, keyed by the command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    SetVoltage { voltage: u8 },
    SetSpeed { speed: u8 },
    SetTimer { speed: u8, timer: u8 },
    JoinRequest { network_id: u32 },
    SetSpeedReply(RawParams),
    JoinOpen { network_id: u32 },
    FanSettings { speed: u8, voltage: u8, timer: u8 },
    JoinSuccess,
    JoinAck { network_id: u32 },
    QueryNetwork,
    QueryDevice,
    SetVoltageReply(RawParams),
    Unknown { command: u8, params: RawParams },
}

impl Payload {
    /// Command byte this payload is sent under
    pub fn command(&self) -> u8 {
        match self {
            Payload::SetVoltage { .. } => command::SET_VOLTAGE,
            Payload::SetSpeed { .. } => command::SET_SPEED,
            Payload::SetTimer { .. } => command::SET_TIMER,
            Payload::JoinRequest { .. } => command::JOIN_REQUEST,
            Payload::SetSpeedReply(_) => command::SET_SPEED_REPLY,
            Payload::JoinOpen { .. } => command::JOIN_OPEN,
            Payload::FanSettings { .. } => command::FAN_SETTINGS,
            Payload::JoinSuccess => command::JOIN_SUCCESS,
            Payload::JoinAck { .. } => command::JOIN_ACK,
            Payload::QueryNetwork => command::QUERY_NETWORK,
            Payload::QueryDevice => command::QUERY_DEVICE,
            Payload::SetVoltageReply(_) => command::SET_VOLTAGE_REPLY,
            Payload::Unknown { command, .. } => *command,
        }
    }

    /// Exact payload length in bytes, written as `parameter_count`
    pub fn len(&self) -> u8 {
        match self {
            Payload::SetVoltage { .. } | Payload::SetSpeed { .. } => 1,
            Payload::SetTimer { .. } => 2,
            Payload::FanSettings { .. } => 3,
            Payload::JoinRequest { .. } | Payload::JoinOpen { .. } | Payload::JoinAck { .. } => 4,
            Payload::JoinSuccess | Payload::QueryNetwork | Payload::QueryDevice => 0,
            Payload::SetSpeedReply(raw) | Payload::SetVoltageReply(raw) => raw.len() as u8,
            Payload::Unknown { params, .. } => params.len() as u8,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded or to-be-encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub rx_type: u8,
    pub rx_id: u8,
    pub tx_type: u8,
    pub tx_id: u8,
    pub ttl: u8,
    /// Parameter count as carried on air; set from the payload on construction
    pub parameter_count: u8,
    pub payload: Payload,
}

impl Frame {
    /// Build a frame with the default TTL
    pub fn new(to: DeviceAddress, from: DeviceAddress, payload: Payload) -> Self {
        Self {
            rx_type: to.device_type,
            rx_id: to.id,
            tx_type: from.device_type,
            tx_id: from.id,
            ttl: DEFAULT_TTL,
            parameter_count: payload.len(),
            payload,
        }
    }

    pub fn command(&self) -> u8 {
        self.payload.command()
    }

    pub fn receiver(&self) -> DeviceAddress {
        DeviceAddress::new(self.rx_type, self.rx_id)
    }

    pub fn sender(&self) -> DeviceAddress {
        DeviceAddress::new(self.tx_type, self.tx_id)
    }

    /// True when the on-air parameter count disagrees with the command's layout
    pub fn has_parameter_mismatch(&self) -> bool {
        self.parameter_count != self.payload.len()
    }
}
