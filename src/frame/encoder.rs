//! # Frame Encoder
//!
//! Serializes a [`Frame`] into its fixed 16-byte wire form.

use super::protocol::*;

/// Encode a frame into exactly 16 bytes
///
/// The `parameter_count` byte is always derived from the payload variant, so
/// an encoded frame is internally consistent even if the caller mutated
/// `frame.parameter_count`. Unused payload bytes are zero.
///
/// # Examples
///
/// ```
/// use zehnder_rf::frame::encoder::encode_frame;
/// use zehnder_rf::frame::protocol::{device_type, DeviceAddress, Frame, Payload};
///
/// let frame = Frame::new(
///     DeviceAddress::new(device_type::MAIN_UNIT, 0x07),
///     DeviceAddress::new(device_type::REMOTE_CONTROL, 0x2A),
///     Payload::SetSpeed { speed: 3 },
/// );
/// let bytes = encode_frame(&frame);
/// assert_eq!(bytes.len(), 16);
/// assert_eq!(bytes[5], 0x02);
/// assert_eq!(bytes[6], 1);
/// assert_eq!(bytes[7], 3);
/// ```
pub fn encode_frame(frame: &Frame) -> [u8; FRAME_SIZE] {
    let mut bytes = [0u8; FRAME_SIZE];

    bytes[0] = frame.rx_type;
    bytes[1] = frame.rx_id;
    bytes[2] = frame.tx_type;
    bytes[3] = frame.tx_id;
    bytes[4] = frame.ttl;
    bytes[5] = frame.payload.command();
    bytes[6] = frame.payload.len();

    encode_payload(&frame.payload, &mut bytes[FRAME_HEADER_SIZE..]);

    bytes
}

/// Write the payload variant into the 9-byte payload area
fn encode_payload(payload: &Payload, out: &mut [u8]) {
    match *payload {
        Payload::SetVoltage { voltage } => out[0] = voltage,
        Payload::SetSpeed { speed } => out[0] = speed,
        Payload::SetTimer { speed, timer } => {
            out[0] = speed;
            out[1] = timer;
        }
        Payload::FanSettings { speed, voltage, timer } => {
            out[0] = speed;
            out[1] = voltage;
            out[2] = timer;
        }
        Payload::JoinRequest { network_id }
        | Payload::JoinOpen { network_id }
        | Payload::JoinAck { network_id } => {
            out[..4].copy_from_slice(&network_id.to_le_bytes());
        }
        Payload::SetSpeedReply(raw)
        | Payload::SetVoltageReply(raw)
        | Payload::Unknown { params: raw, .. } => {
            out[..raw.len()].copy_from_slice(raw.as_slice());
        }
        Payload::JoinSuccess | Payload::QueryNetwork | Payload::QueryDevice => {}
    }
}
