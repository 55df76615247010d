//! Application-layer state and the values published to the host

use serde::Serialize;

use crate::frame::protocol::speed;

/// Application protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Waiting out the boot grace period
    Startup,
    /// Broadcast a join request on the link address
    StartDiscovery,
    /// Waiting for a main unit to open its network
    DiscoveryWaitForLinkRequest,
    /// Join request sent, waiting for the main unit to accept
    DiscoveryWaitForJoinResponse,
    /// Join acknowledged, waiting for the main unit's network query
    DiscoveryJoinComplete,
    /// Paired and resting
    Idle,
    /// Fire-and-forget speed command on its way out
    WaitSetSpeedConfirm,
    /// Device query sent, waiting for the fan settings reply
    WaitFanSettings,
}

impl AppState {
    /// Pairing is in progress
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            AppState::StartDiscovery
                | AppState::DiscoveryWaitForLinkRequest
                | AppState::DiscoveryWaitForJoinResponse
                | AppState::DiscoveryJoinComplete
        )
    }
}

/// Latest desired speed/timer, waiting for the link to be free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCommand {
    pub speed: u8,
    /// Timer in minutes; 0 sends a plain speed command
    pub timer: u8,
}

/// Fan state as seen by the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanState {
    pub on: bool,
    pub speed: u8,
    /// Ventilation level in percent
    pub voltage: u8,
    pub timer: bool,
}

/// Auxiliary sensor values derived from a fan settings report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "metric", content = "value", rename_all = "snake_case")]
pub enum SensorReading {
    VentilationPercentage(u8),
    TimerActive(bool),
    VentilationMode(&'static str),
}

/// Something the host should publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FanEvent {
    StateChanged(FanState),
    Sensor(SensorReading),
}

/// Human readable label for a speed preset
pub fn speed_to_mode(preset: u8) -> &'static str {
    match preset {
        speed::AUTO => "Auto",
        speed::LOW => "Low",
        speed::MEDIUM => "Medium",
        speed::HIGH => "High",
        speed::MAX => "Max",
        _ => "Unknown",
    }
}
