//! # Frame Decoder
//!
//! Parses received bytes into a [`Frame`].

use super::protocol::*;
use crate::error::{Result, ZehnderError};

/// Decode a received frame
///
/// # Arguments
///
/// * `data` - Raw bytes from the radio (at least 16; extra bytes are ignored)
///
/// # Returns
///
/// * `Result<Frame>` - Decoded frame or `MalformedFrame` if too short
///
/// The payload variant is chosen purely by the command byte and read at its
/// fixed layout. `parameter_count` is kept as received and is not checked
/// against the command; see [`Frame::has_parameter_mismatch`].
pub fn decode_frame(data: &[u8]) -> Result<Frame> {
    if data.len() < FRAME_SIZE {
        return Err(ZehnderError::MalformedFrame {
            expected: FRAME_SIZE,
            actual: data.len(),
        });
    }

    let parameter_count = data[6];
    let params = &data[FRAME_HEADER_SIZE..FRAME_SIZE];

    Ok(Frame {
        rx_type: data[0],
        rx_id: data[1],
        tx_type: data[2],
        tx_id: data[3],
        ttl: data[4],
        parameter_count,
        payload: decode_payload(data[5], parameter_count, params),
    })
}

fn decode_payload(cmd: u8, parameter_count: u8, params: &[u8]) -> Payload {
    let network_id = || u32::from_le_bytes([params[0], params[1], params[2], params[3]]);
    let raw = || RawParams::from_slice(&params[..(parameter_count as usize).min(FRAME_PAYLOAD_SIZE)]);

    match cmd {
        command::SET_VOLTAGE => Payload::SetVoltage { voltage: params[0] },
        command::SET_SPEED => Payload::SetSpeed { speed: params[0] },
        command::SET_TIMER => Payload::SetTimer {
            speed: params[0],
            timer: params[1],
        },
        command::JOIN_REQUEST => Payload::JoinRequest { network_id: network_id() },
        command::SET_SPEED_REPLY => Payload::SetSpeedReply(raw()),
        command::JOIN_OPEN => Payload::JoinOpen { network_id: network_id() },
        command::FAN_SETTINGS => Payload::FanSettings {
            speed: params[0],
            voltage: params[1],
            timer: params[2],
        },
        command::JOIN_SUCCESS => Payload::JoinSuccess,
        command::JOIN_ACK => Payload::JoinAck { network_id: network_id() },
        command::QUERY_NETWORK => Payload::QueryNetwork,
        command::QUERY_DEVICE => Payload::QueryDevice,
        command::SET_VOLTAGE_REPLY => Payload::SetVoltageReply(raw()),
        other => Payload::Unknown {
            command: other,
            params: raw(),
        },
    }
}
