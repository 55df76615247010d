//! Device id selection for discovery

use rand::Rng;

/// Lowest usable device id (0x00 is broadcast)
pub const DEVICE_ID_MIN: u8 = 0x01;

/// Highest usable device id (0xFF is the wildcard)
pub const DEVICE_ID_MAX: u8 = 0xFE;

/// Source of the byte our device id is derived from
#[cfg_attr(test, mockall::automock)]
pub trait IdentitySource {
    fn identity_byte(&mut self) -> u8;
}

/// A new random byte on every discovery attempt
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdentity;

impl IdentitySource for RandomIdentity {
    fn identity_byte(&mut self) -> u8 {
        rand::thread_rng().gen()
    }
}

/// Always the same byte, e.g. the last byte of a hardware MAC
#[derive(Debug, Clone, Copy)]
pub struct FixedIdentity(pub u8);

impl IdentitySource for FixedIdentity {
    fn identity_byte(&mut self) -> u8 {
        self.0
    }
}

/// Clamp an identity byte into the assignable range
///
/// No uniqueness check is made against the main unit's own id.
pub fn device_id_from(identity: u8) -> u8 {
    identity.clamp(DEVICE_ID_MIN, DEVICE_ID_MAX)
}
