//! # Fan Controller Module
//!
//! Application-layer protocol engine: pairing with a main unit, then setting
//! the fan speed and polling its settings.
//!
//! ## Pairing
//!
//! | Step | We send | We wait for |
//! |------|---------|-------------|
//! | 1 | `JoinRequest { network_id: 0 }` broadcast on the link address | `JoinOpen` from a main unit |
//! | 2 | `JoinRequest` echoing the offered network id | `JoinSuccess` addressed to us |
//! | 3 | `JoinSuccess` | `QueryNetwork` from the main unit |
//!
//! The session is persisted only after step 3. Exhausting the retries of any
//! step restarts pairing from step 1.
//!
//! ## Usage
//!
//! The host drives the controller from one event loop:
//!
//! - [`FanController::poll`] on every tick
//! - [`FanController::on_transmit_complete`] when the radio reports a frame sent
//! - [`FanController::on_receive`] with every received frame
//! - [`FanController::drain_events`] to publish state changes

pub mod identity;
pub mod state;

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ZehnderError;
use crate::frame::decode_frame;
use crate::frame::protocol::{device_type, speed, DeviceAddress, Frame, Payload, NETWORK_LINK_ID};
use crate::link::radio::RadioDriver;
use crate::link::{Delivery, LinkEngine, LinkTimeout, TxOutcome};
use crate::session::store::PairingStore;
use crate::session::SessionConfig;
use identity::{device_id_from, IdentitySource};
use state::{speed_to_mode, AppState, FanEvent, FanState, PendingCommand, SensorReading};

/// Timing and retry knobs for the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// Grace period after start before talking to the main unit
    pub startup_delay: Duration,
    /// Interval between fan settings queries
    pub update_interval: Duration,
    /// Highest speed preset the unit accepts
    pub speed_count: u8,
    /// Retries for queries and pairing replies
    pub tx_retries: u8,
    /// Retries for the initial discovery broadcast
    pub discovery_retries: u8,
    /// Delay before retrying a discovery broadcast the link rejected
    pub busy_backoff: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_secs(15),
            update_interval: Duration::from_secs(15),
            speed_count: speed::MAX,
            tx_retries: 10,
            discovery_retries: 20,
            busy_backoff: Duration::from_secs(1),
        }
    }
}

/// Zehnder fan remote control
pub struct FanController<R> {
    link: LinkEngine<R, AppState>,
    store: Box<dyn PairingStore>,
    identity: Box<dyn IdentitySource>,
    settings: ControllerSettings,
    state: AppState,
    session: SessionConfig,
    pending: Option<PendingCommand>,
    fan: FanState,
    booted_at: Instant,
    last_query: Option<Instant>,
    retry_at: Option<Instant>,
    events: Vec<FanEvent>,
}

impl<R> std::fmt::Debug for FanController<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanController")
            .field("state", &self.state)
            .field("session", &self.session)
            .field("fan", &self.fan)
            .finish_non_exhaustive()
    }
}

impl<R: RadioDriver> FanController<R> {
    /// Create a controller and load the stored pairing
    pub fn new(
        radio: R,
        store: Box<dyn PairingStore>,
        identity: Box<dyn IdentitySource>,
        settings: ControllerSettings,
        now: Instant,
    ) -> Self {
        Self::with_link(LinkEngine::new(radio), store, identity, settings, now)
    }

    /// Create a controller around an existing link engine
    pub fn with_link(
        link: LinkEngine<R, AppState>,
        mut store: Box<dyn PairingStore>,
        identity: Box<dyn IdentitySource>,
        settings: ControllerSettings,
        now: Instant,
    ) -> Self {
        let session = match store.load() {
            Ok(Some(session)) => {
                info!(
                    "Loaded pairing: network 0x{:08X}, main unit 0x{:02X}/0x{:02X}",
                    session.network_id, session.main_unit_type, session.main_unit_id
                );
                session
            }
            Ok(None) => {
                info!("No stored pairing");
                SessionConfig::default()
            }
            Err(e) => {
                warn!("Failed to load pairing, starting unpaired: {}", e);
                SessionConfig::default()
            }
        };

        Self {
            link,
            store,
            identity,
            settings,
            state: AppState::Startup,
            session,
            pending: None,
            fan: FanState::default(),
            booted_at: now,
            last_query: None,
            retry_at: None,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    pub fn fan_state(&self) -> FanState {
        self.fan
    }

    pub fn pending(&self) -> Option<PendingCommand> {
        self.pending
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn link(&self) -> &LinkEngine<R, AppState> {
        &self.link
    }

    pub fn radio_mut(&mut self) -> &mut R {
        self.link.radio_mut()
    }

    /// Take everything published since the last call
    pub fn drain_events(&mut self) -> Vec<FanEvent> {
        std::mem::take(&mut self.events)
    }

    /// Ask for the fan on at `speed`, or off
    ///
    /// The command is sent from `Idle`; a newer request replaces one that has
    /// not been sent yet.
    pub fn request(&mut self, on: bool, speed: u8) {
        let speed = if on { self.clamp_speed(speed) } else { speed::AUTO };
        debug!("Control: on={} speed={}", on, speed);

        self.pending = Some(PendingCommand { speed, timer: 0 });
        self.fan.on = speed > 0;
        self.fan.speed = speed;
        self.events.push(FanEvent::StateChanged(self.fan));
    }

    /// Ask for `speed` for `minutes`, after which the unit falls back
    pub fn request_timer(&mut self, speed: u8, minutes: u8) {
        let speed = self.clamp_speed(speed);
        debug!("Control: speed={} timer={} minutes", speed, minutes);

        self.pending = Some(PendingCommand { speed, timer: minutes });
        self.fan.on = speed > 0;
        self.fan.speed = speed;
        self.fan.timer = minutes > 0;
        self.events.push(FanEvent::StateChanged(self.fan));
    }

    /// Forget the current pairing and start discovery again
    ///
    /// The stored pairing is only replaced once the new pairing completes.
    pub fn reset_pairing(&mut self) {
        info!("Pairing reset requested");
        self.link.complete();
        self.pending = None;
        self.restart_discovery();
    }

    /// Drop everything a pairing attempt captured and start over
    fn restart_discovery(&mut self) {
        self.session = SessionConfig::default();
        self.retry_at = None;
        self.state = AppState::StartDiscovery;
    }

    /// Advance timers and the state machine; call on every tick
    pub fn poll(&mut self, now: Instant) {
        if let Some(timeout) = self.link.poll(now) {
            self.handle_link_timeout(timeout);
            return;
        }

        match self.state {
            AppState::Startup => self.handle_startup(now),
            AppState::StartDiscovery => self.start_discovery(now),
            AppState::Idle => self.handle_idle(now),
            AppState::DiscoveryWaitForLinkRequest
            | AppState::DiscoveryWaitForJoinResponse
            | AppState::DiscoveryJoinComplete
            | AppState::WaitSetSpeedConfirm
            | AppState::WaitFanSettings => {}
        }
    }

    /// The radio finished sending the loaded frame
    pub fn on_transmit_complete(&mut self, now: Instant) {
        if let Some(TxOutcome::Delivered) = self.link.on_transmit_complete(now) {
            if self.state == AppState::WaitSetSpeedConfirm {
                debug!("Speed command sent");
                self.state = AppState::Idle;
            }
        }
    }

    /// The radio received a frame
    pub fn on_receive(&mut self, data: &[u8], now: Instant) {
        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Discarding received data: {}", e);
                return;
            }
        };

        debug!(
            "Received command 0x{:02X} from 0x{:02X}/0x{:02X} to 0x{:02X}/0x{:02X} in {:?}",
            frame.command(),
            frame.tx_type,
            frame.tx_id,
            frame.rx_type,
            frame.rx_id,
            self.state
        );
        if frame.has_parameter_mismatch() {
            debug!(
                "Command 0x{:02X} carries {} parameters, expected {}",
                frame.command(),
                frame.parameter_count,
                frame.payload.len()
            );
        }

        match self.state {
            AppState::DiscoveryWaitForLinkRequest => self.handle_link_request(&frame, now),
            AppState::DiscoveryWaitForJoinResponse => self.handle_join_response(&frame, now),
            AppState::DiscoveryJoinComplete => self.handle_join_complete(&frame),
            AppState::WaitFanSettings => self.handle_fan_settings(&frame),
            AppState::Startup
            | AppState::StartDiscovery
            | AppState::Idle
            | AppState::WaitSetSpeedConfirm => {
                debug!("No reply expected in {:?}, ignoring frame", self.state);
            }
        }
    }

    fn handle_link_timeout(&mut self, timeout: LinkTimeout<AppState>) {
        warn!("{} in {:?}", timeout.error, self.state);
        match timeout.on_timeout {
            Some(AppState::StartDiscovery) => self.restart_discovery(),
            Some(next) => self.state = next,
            None => {}
        }
    }

    fn handle_startup(&mut self, now: Instant) {
        if now.duration_since(self.booted_at) < self.settings.startup_delay {
            return;
        }

        if !self.session.is_paired() {
            info!("Not paired, starting discovery");
            self.state = AppState::StartDiscovery;
            return;
        }

        if let Err(e) = self.link.radio_mut().set_channel_address(self.session.network_id) {
            warn!("Failed to set network address: {}", e);
        }
        info!("Paired on network 0x{:08X}, ready", self.session.network_id);
        self.last_query = None;
        self.state = AppState::Idle;
    }

    fn start_discovery(&mut self, now: Instant) {
        if self.retry_at.is_some_and(|at| now < at) {
            return;
        }
        self.retry_at = None;

        // A fresh id on every attempt keeps competing remotes from colliding forever
        let device_id = device_id_from(self.identity.identity_byte());
        self.session.my_device_type = device_type::REMOTE_CONTROL;
        self.session.my_device_id = device_id;

        if let Err(e) = self.link.radio_mut().set_channel_address(NETWORK_LINK_ID) {
            warn!("Failed to set link address: {}", e);
            self.retry_at = Some(now + self.settings.busy_backoff);
            return;
        }

        let frame = Frame::new(
            DeviceAddress::broadcast(),
            self.session.local(),
            Payload::JoinRequest { network_id: 0 },
        );
        let delivery = Delivery::AwaitReply {
            retries: self.settings.discovery_retries,
        };

        match self
            .link
            .start_transmit(&frame, delivery, Some(AppState::StartDiscovery), now)
        {
            Ok(()) => {
                info!("Start discovery with ID 0x{:02X}", device_id);
                self.state = AppState::DiscoveryWaitForLinkRequest;
            }
            Err(e) => {
                debug!("Discovery broadcast not sent ({}), retrying in {:?}", e, self.settings.busy_backoff);
                self.retry_at = Some(now + self.settings.busy_backoff);
            }
        }
    }

    fn handle_idle(&mut self, now: Instant) {
        if let Some(command) = self.pending {
            if self.send_speed(command, now) {
                self.pending = None;
            }
            return;
        }

        let due = self
            .last_query
            .map_or(true, |at| now.duration_since(at) >= self.settings.update_interval);
        if due {
            self.query_device(now);
        }
    }

    /// Returns false when the link rejected the command; it stays pending
    fn send_speed(&mut self, command: PendingCommand, now: Instant) -> bool {
        let speed = self.clamp_speed(command.speed);
        let payload = if command.timer == 0 {
            Payload::SetSpeed { speed }
        } else {
            Payload::SetTimer { speed, timer: command.timer }
        };
        // Speed commands go to every main unit on the network
        let to = DeviceAddress::new(self.session.main_unit_type, 0x00);
        let frame = Frame::new(to, self.session.local(), payload);

        match self
            .link
            .start_transmit(&frame, Delivery::FireAndForget, Some(AppState::Idle), now)
        {
            Ok(()) => {
                info!("Set speed: 0x{:02X}; Timer {} minutes", speed, command.timer);
                self.last_query = Some(now);
                self.state = AppState::WaitSetSpeedConfirm;
                true
            }
            Err(e) => {
                debug!("Speed command deferred: {}", e);
                false
            }
        }
    }

    fn query_device(&mut self, now: Instant) {
        let frame = Frame::new(self.session.peer(), self.session.local(), Payload::QueryDevice);
        let delivery = Delivery::AwaitReply {
            retries: self.settings.tx_retries,
        };

        match self.link.start_transmit(&frame, delivery, Some(AppState::Idle), now) {
            Ok(()) => {
                debug!("Query device");
                self.last_query = Some(now);
                self.state = AppState::WaitFanSettings;
            }
            Err(e) => debug!("Query deferred: {}", e),
        }
    }

    fn handle_link_request(&mut self, frame: &Frame, now: Instant) {
        let Payload::JoinOpen { network_id } = frame.payload else {
            debug!(
                "Discovery: Received unexpected frame type 0x{:02X} from ID 0x{:02X}",
                frame.command(),
                frame.tx_id
            );
            return;
        };

        if frame.tx_type != device_type::MAIN_UNIT {
            debug!(
                "Discovery: Ignoring network 0x{:08X} offered by type 0x{:02X}",
                network_id, frame.tx_type
            );
            return;
        }
        if network_id == 0 {
            warn!("Discovery: Main unit 0x{:02X} offered network 0, ignoring", frame.tx_id);
            return;
        }

        info!(
            "Discovery: Found main unit with ID 0x{:02X} on network 0x{:08X}",
            frame.tx_id, network_id
        );
        self.link.complete();

        self.session.network_id = network_id;
        self.session.main_unit_type = frame.tx_type;
        self.session.main_unit_id = frame.tx_id;

        if let Err(e) = self.link.radio_mut().set_channel_address(network_id) {
            warn!("Failed to set network address: {}", e);
        }

        let reply = Frame::new(
            self.session.peer(),
            self.session.local(),
            Payload::JoinRequest { network_id },
        );
        self.send_discovery_step(&reply, AppState::DiscoveryWaitForJoinResponse, now);
    }

    fn handle_join_response(&mut self, frame: &Frame, now: Instant) {
        if frame.payload != Payload::JoinSuccess {
            debug!(
                "Discovery: Received unexpected frame type 0x{:02X} from ID 0x{:02X}",
                frame.command(),
                frame.tx_id
            );
            return;
        }
        if frame.receiver() != self.session.local() || frame.sender() != self.session.peer() {
            self.log_mismatch(frame);
            return;
        }

        info!(
            "Discovery: Link successful to unit with ID 0x{:02X} on network 0x{:08X}",
            frame.tx_id, self.session.network_id
        );
        self.link.complete();

        let ack = Frame::new(self.session.peer(), self.session.local(), Payload::JoinSuccess);
        self.send_discovery_step(&ack, AppState::DiscoveryJoinComplete, now);
    }

    fn handle_join_complete(&mut self, frame: &Frame) {
        if frame.payload != Payload::QueryNetwork {
            debug!(
                "Discovery: Received unexpected frame type 0x{:02X} from ID 0x{:02X}",
                frame.command(),
                frame.tx_id
            );
            return;
        }

        // The main unit addresses its network query either to us or to itself
        let receiver = frame.receiver();
        let addressed = receiver == self.session.local() || receiver == self.session.peer();
        if !addressed || frame.sender() != self.session.peer() {
            self.log_mismatch(frame);
            return;
        }

        self.link.complete();
        info!(
            "Discovery: Paired with main unit 0x{:02X} on network 0x{:08X}",
            self.session.main_unit_id, self.session.network_id
        );

        if let Err(e) = self.store.save(&self.session) {
            warn!("Failed to save pairing, it will be lost on restart: {}", e);
        }

        self.last_query = None;
        self.state = AppState::Idle;
    }

    fn handle_fan_settings(&mut self, frame: &Frame) {
        if frame.receiver() != self.session.local() || frame.sender() != self.session.peer() {
            self.log_mismatch(frame);
            return;
        }

        let Payload::FanSettings { speed, voltage, timer } = frame.payload else {
            debug!(
                "Received unexpected frame; type 0x{:02X} from ID 0x{:02X}",
                frame.command(),
                frame.tx_id
            );
            return;
        };

        debug!(
            "Received fan settings; speed: 0x{:02X} voltage: {} timer: {}",
            speed, voltage, timer
        );
        self.link.complete();

        self.fan = FanState {
            on: speed > 0,
            speed,
            voltage,
            timer: timer > 0,
        };
        self.publish();
        self.state = AppState::Idle;
    }

    fn send_discovery_step(&mut self, frame: &Frame, next: AppState, now: Instant) {
        let delivery = Delivery::AwaitReply {
            retries: self.settings.tx_retries,
        };

        match self
            .link
            .start_transmit(frame, delivery, Some(AppState::StartDiscovery), now)
        {
            Ok(()) => self.state = next,
            Err(e) => {
                warn!("Discovery: Failed to send 0x{:02X}: {}", frame.command(), e);
                self.restart_discovery();
            }
        }
    }

    fn publish(&mut self) {
        info!(
            "Fan: on={} speed={} ({}) voltage={}% timer={}",
            self.fan.on,
            self.fan.speed,
            speed_to_mode(self.fan.speed),
            self.fan.voltage,
            self.fan.timer
        );
        self.events.push(FanEvent::StateChanged(self.fan));
        self.events.push(FanEvent::Sensor(SensorReading::VentilationPercentage(self.fan.voltage)));
        self.events.push(FanEvent::Sensor(SensorReading::TimerActive(self.fan.timer)));
        self.events.push(FanEvent::Sensor(SensorReading::VentilationMode(speed_to_mode(
            self.fan.speed,
        ))));
    }

    fn log_mismatch(&self, frame: &Frame) {
        let error = ZehnderError::AddressMismatch {
            command: frame.command(),
            rx_type: frame.rx_type,
            rx_id: frame.rx_id,
            tx_type: frame.tx_type,
            tx_id: frame.tx_id,
        };
        debug!("Discarding frame in {:?}: {}", self.state, error);
    }

    fn clamp_speed(&self, requested: u8) -> u8 {
        if requested > self.settings.speed_count {
            warn!("Requested speed too high ({})", requested);
            self.settings.speed_count
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::identity::MockIdentitySource;
    use super::*;
    use crate::frame::encode_frame;
    use crate::frame::protocol::command;
    use crate::link::radio::mocks::MockRadio;
    use crate::link::{LinkState, AIRWAY_TIMEOUT, REPLY_TIMEOUT};
    use crate::session::store::MockPairingStore;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const NETWORK: u32 = 0x1234;
    const MAIN_ID: u8 = 7;
    const MY_ID: u8 = 0x2A;

    fn paired_session() -> SessionConfig {
        SessionConfig {
            network_id: NETWORK,
            my_device_type: device_type::REMOTE_CONTROL,
            my_device_id: MY_ID,
            main_unit_type: device_type::MAIN_UNIT,
            main_unit_id: MAIN_ID,
        }
    }

    fn main_unit() -> DeviceAddress {
        DeviceAddress::new(device_type::MAIN_UNIT, MAIN_ID)
    }

    fn me() -> DeviceAddress {
        DeviceAddress::new(device_type::REMOTE_CONTROL, MY_ID)
    }

    fn store_with(session: Option<SessionConfig>) -> MockPairingStore {
        let mut store = MockPairingStore::new();
        store.expect_load().times(1).returning(move || Ok(session));
        store
    }

    fn identity() -> MockIdentitySource {
        let mut identity = MockIdentitySource::new();
        identity.expect_identity_byte().returning(|| MY_ID);
        identity
    }

    fn settings() -> ControllerSettings {
        ControllerSettings::default()
    }

    fn controller(
        store: MockPairingStore,
        settings: ControllerSettings,
        start: Instant,
    ) -> (FanController<MockRadio>, MockRadio) {
        let radio = MockRadio::new();
        let link = LinkEngine::with_rng(radio.clone(), StdRng::seed_from_u64(1));
        let controller =
            FanController::with_link(link, Box::new(store), Box::new(identity()), settings, start);
        (controller, radio)
    }

    /// Paired controller that has finished startup and rests in Idle
    fn idle_controller(start: Instant) -> (FanController<MockRadio>, MockRadio, Instant) {
        let (mut controller, radio) = controller(store_with(Some(paired_session())), settings(), start);
        let now = start + settings().startup_delay;
        controller.poll(now);
        assert_eq!(controller.state(), AppState::Idle);
        (controller, radio, now)
    }

    /// Let the link put the loaded frame on air
    fn transmit(controller: &mut FanController<MockRadio>, now: Instant) {
        controller.poll(now);
        controller.on_transmit_complete(now);
    }

    fn receive(controller: &mut FanController<MockRadio>, frame: Frame, now: Instant) {
        controller.on_receive(&encode_frame(&frame), now);
    }

    fn last_sent(radio: &MockRadio) -> Frame {
        decode_frame(&radio.last_loaded().expect("a loaded frame")).unwrap()
    }

    #[test]
    fn test_startup_waits_for_grace_period() {
        let start = Instant::now();
        let (mut controller, radio) = controller(store_with(None), settings(), start);

        controller.poll(start + Duration::from_secs(14));
        assert_eq!(controller.state(), AppState::Startup);
        assert!(radio.loaded_frames().is_empty());
    }

    #[test]
    fn test_unpaired_startup_broadcasts_join_request() {
        let start = Instant::now();
        let (mut controller, radio) = controller(store_with(None), settings(), start);
        let now = start + settings().startup_delay;

        controller.poll(now);
        assert_eq!(controller.state(), AppState::StartDiscovery);

        controller.poll(now);
        assert_eq!(controller.state(), AppState::DiscoveryWaitForLinkRequest);
        assert_eq!(radio.addresses(), vec![NETWORK_LINK_ID]);

        let sent = last_sent(&radio);
        assert_eq!(sent.receiver(), DeviceAddress::broadcast());
        assert_eq!(sent.sender(), me());
        assert_eq!(sent.payload, Payload::JoinRequest { network_id: 0 });
        assert_eq!(controller.link().retries_remaining(), Some(20));
    }

    #[test]
    fn test_paired_startup_sets_address_and_queries() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);
        assert_eq!(radio.addresses(), vec![NETWORK]);

        controller.poll(now);
        assert_eq!(controller.state(), AppState::WaitFanSettings);

        let sent = last_sent(&radio);
        assert_eq!(sent.receiver(), main_unit());
        assert_eq!(sent.sender(), me());
        assert_eq!(sent.payload, Payload::QueryDevice);
    }

    #[test]
    fn test_store_load_error_starts_unpaired() {
        let start = Instant::now();
        let mut store = MockPairingStore::new();
        store
            .expect_load()
            .times(1)
            .returning(|| Err(ZehnderError::Bridge("disk on fire".to_string())));

        let (controller, _radio) = controller(store, settings(), start);
        assert!(!controller.session().is_paired());
    }

    #[test]
    fn test_discovery_happy_path() {
        let start = Instant::now();
        let mut store = store_with(None);
        store
            .expect_save()
            .withf(|session| {
                *session
                    == SessionConfig {
                        network_id: NETWORK,
                        my_device_type: device_type::REMOTE_CONTROL,
                        my_device_id: MY_ID,
                        main_unit_type: device_type::MAIN_UNIT,
                        main_unit_id: MAIN_ID,
                    }
            })
            .times(1)
            .returning(|_| Ok(()));

        let (mut controller, radio) = controller(store, settings(), start);
        let now = start + settings().startup_delay;
        controller.poll(now);
        controller.poll(now);
        transmit(&mut controller, now);
        assert_eq!(controller.link().state(), LinkState::RxWait);

        // Main unit opens its network
        receive(
            &mut controller,
            Frame::new(DeviceAddress::broadcast(), main_unit(), Payload::JoinOpen { network_id: NETWORK }),
            now,
        );
        assert_eq!(controller.state(), AppState::DiscoveryWaitForJoinResponse);
        assert_eq!(radio.addresses(), vec![NETWORK_LINK_ID, NETWORK]);
        let sent = last_sent(&radio);
        assert_eq!(sent.receiver(), main_unit());
        assert_eq!(sent.sender(), me());
        assert_eq!(sent.payload, Payload::JoinRequest { network_id: NETWORK });
        transmit(&mut controller, now);

        // Main unit accepts
        receive(&mut controller, Frame::new(me(), main_unit(), Payload::JoinSuccess), now);
        assert_eq!(controller.state(), AppState::DiscoveryJoinComplete);
        let sent = last_sent(&radio);
        assert_eq!(sent.receiver(), main_unit());
        assert_eq!(sent.payload, Payload::JoinSuccess);
        transmit(&mut controller, now);

        // Main unit queries the network, pairing done
        receive(&mut controller, Frame::new(main_unit(), main_unit(), Payload::QueryNetwork), now);
        assert_eq!(controller.state(), AppState::Idle);
        assert!(controller.link().is_idle());
        assert_eq!(*controller.session(), paired_session());
    }

    #[test]
    fn test_join_open_from_non_main_unit_is_ignored() {
        let start = Instant::now();
        let (mut controller, radio) = controller(store_with(None), settings(), start);
        let now = start + settings().startup_delay;
        controller.poll(now);
        controller.poll(now);

        let sensor = DeviceAddress::new(device_type::CO2_SENSOR, 9);
        receive(
            &mut controller,
            Frame::new(DeviceAddress::broadcast(), sensor, Payload::JoinOpen { network_id: NETWORK }),
            now,
        );

        assert_eq!(controller.state(), AppState::DiscoveryWaitForLinkRequest);
        assert_eq!(controller.session().network_id, 0);
        assert_eq!(radio.loaded_frames().len(), 1);
    }

    #[test]
    fn test_join_success_from_wrong_peer_is_ignored() {
        let start = Instant::now();
        let (mut controller, _radio) = controller(store_with(None), settings(), start);
        let now = start + settings().startup_delay;
        controller.poll(now);
        controller.poll(now);
        receive(
            &mut controller,
            Frame::new(DeviceAddress::broadcast(), main_unit(), Payload::JoinOpen { network_id: NETWORK }),
            now,
        );
        transmit(&mut controller, now);

        let stranger = DeviceAddress::new(device_type::MAIN_UNIT, MAIN_ID + 1);
        receive(&mut controller, Frame::new(me(), stranger, Payload::JoinSuccess), now);
        assert_eq!(controller.state(), AppState::DiscoveryWaitForJoinResponse);

        let other_remote = DeviceAddress::new(device_type::REMOTE_CONTROL, MY_ID + 1);
        receive(&mut controller, Frame::new(other_remote, main_unit(), Payload::JoinSuccess), now);
        assert_eq!(controller.state(), AppState::DiscoveryWaitForJoinResponse);
        assert_eq!(controller.link().state(), LinkState::RxWait);
    }

    #[test]
    fn test_discovery_step_exhaustion_restarts_discovery() {
        let start = Instant::now();
        let settings = ControllerSettings { tx_retries: 0, ..settings() };
        let (mut controller, radio) = controller(store_with(None), settings, start);
        let now = start + settings.startup_delay;
        controller.poll(now);
        controller.poll(now);
        receive(
            &mut controller,
            Frame::new(DeviceAddress::broadcast(), main_unit(), Payload::JoinOpen { network_id: NETWORK }),
            now,
        );
        transmit(&mut controller, now);

        assert_eq!(controller.session().network_id, NETWORK);

        controller.poll(now + REPLY_TIMEOUT + Duration::from_millis(1));
        assert_eq!(controller.state(), AppState::StartDiscovery);
        assert!(controller.link().is_idle());
        assert!(!controller.session().is_paired());
        assert_eq!(controller.session().network_id, 0);
        assert_eq!(controller.session().main_unit_id, 0);

        // Next tick broadcasts again on the link address
        controller.poll(now + REPLY_TIMEOUT + Duration::from_millis(2));
        assert_eq!(controller.state(), AppState::DiscoveryWaitForLinkRequest);
        assert_eq!(last_sent(&radio).payload, Payload::JoinRequest { network_id: 0 });
        assert_eq!(radio.addresses().last(), Some(&NETWORK_LINK_ID));
    }

    #[test]
    fn test_join_complete_exhaustion_restarts_discovery() {
        let start = Instant::now();
        let settings = ControllerSettings { tx_retries: 0, ..settings() };
        let (mut controller, _radio) = controller(store_with(None), settings, start);
        let now = start + settings.startup_delay;
        controller.poll(now);
        controller.poll(now);
        receive(
            &mut controller,
            Frame::new(DeviceAddress::broadcast(), main_unit(), Payload::JoinOpen { network_id: NETWORK }),
            now,
        );
        transmit(&mut controller, now);
        receive(&mut controller, Frame::new(me(), main_unit(), Payload::JoinSuccess), now);
        transmit(&mut controller, now);
        assert_eq!(controller.state(), AppState::DiscoveryJoinComplete);

        assert!(controller.session().is_paired());

        controller.poll(now + REPLY_TIMEOUT + Duration::from_millis(1));
        assert_eq!(controller.state(), AppState::StartDiscovery);
        assert!(!controller.session().is_paired());
    }

    #[test]
    fn test_save_failure_keeps_pairing_in_memory() {
        let start = Instant::now();
        let mut store = store_with(None);
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(ZehnderError::Io(std::io::Error::other("read-only"))));

        let (mut controller, _radio) = controller(store, settings(), start);
        let now = start + settings().startup_delay;
        controller.poll(now);
        controller.poll(now);
        receive(
            &mut controller,
            Frame::new(DeviceAddress::broadcast(), main_unit(), Payload::JoinOpen { network_id: NETWORK }),
            now,
        );
        receive(&mut controller, Frame::new(me(), main_unit(), Payload::JoinSuccess), now);
        receive(&mut controller, Frame::new(me(), main_unit(), Payload::QueryNetwork), now);

        assert_eq!(controller.state(), AppState::Idle);
        assert!(controller.session().is_paired());
    }

    #[test]
    fn test_set_speed_happy_path() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);

        controller.request(true, 3);
        assert_eq!(controller.pending(), Some(PendingCommand { speed: 3, timer: 0 }));

        controller.poll(now);
        assert_eq!(controller.state(), AppState::WaitSetSpeedConfirm);
        assert_eq!(controller.pending(), None);

        let sent = last_sent(&radio);
        assert_eq!(sent.command(), command::SET_SPEED);
        assert_eq!(sent.receiver(), DeviceAddress::new(device_type::MAIN_UNIT, 0x00));
        assert_eq!(sent.sender(), me());
        assert_eq!(sent.payload, Payload::SetSpeed { speed: 3 });

        transmit(&mut controller, now);
        assert_eq!(controller.state(), AppState::Idle);
        assert!(controller.link().is_idle());
    }

    #[test]
    fn test_speed_above_maximum_is_clamped() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);

        controller.request(true, 200);
        controller.poll(now);

        assert_eq!(last_sent(&radio).payload, Payload::SetSpeed { speed: speed::MAX });
        assert_eq!(controller.fan_state().speed, speed::MAX);
    }

    #[test]
    fn test_clamp_follows_configured_speed_count() {
        let start = Instant::now();
        let settings = ControllerSettings { speed_count: 3, ..settings() };
        let (mut controller, radio) = controller(store_with(Some(paired_session())), settings, start);
        let now = start + settings.startup_delay;
        controller.poll(now);

        controller.request_timer(4, 30);
        controller.poll(now);
        assert_eq!(last_sent(&radio).payload, Payload::SetTimer { speed: 3, timer: 30 });
    }

    #[test]
    fn test_request_off_sends_auto() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);

        controller.request(false, 3);
        controller.poll(now);

        assert_eq!(last_sent(&radio).payload, Payload::SetSpeed { speed: speed::AUTO });
        assert!(!controller.fan_state().on);
    }

    #[test]
    fn test_request_publishes_state() {
        let start = Instant::now();
        let (mut controller, _radio, _now) = idle_controller(start);

        controller.request(true, 2);
        assert_eq!(
            controller.drain_events(),
            vec![FanEvent::StateChanged(FanState { on: true, speed: 2, voltage: 0, timer: false })]
        );
        assert!(controller.drain_events().is_empty());
    }

    #[test]
    fn test_newer_request_replaces_pending() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);

        controller.request(true, 1);
        controller.request_timer(2, 15);
        controller.poll(now);

        assert_eq!(radio.loaded_frames().len(), 1);
        assert_eq!(last_sent(&radio).payload, Payload::SetTimer { speed: 2, timer: 15 });
    }

    #[test]
    fn test_request_during_query_waits_for_idle() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);
        controller.poll(now);
        transmit(&mut controller, now);
        assert_eq!(controller.state(), AppState::WaitFanSettings);

        controller.request(true, 4);
        controller.poll(now);
        assert_eq!(controller.pending(), Some(PendingCommand { speed: 4, timer: 0 }));
        assert_eq!(last_sent(&radio).payload, Payload::QueryDevice);

        receive(
            &mut controller,
            Frame::new(me(), main_unit(), Payload::FanSettings { speed: 1, voltage: 30, timer: 0 }),
            now,
        );
        controller.poll(now);
        assert_eq!(controller.state(), AppState::WaitSetSpeedConfirm);
        assert_eq!(last_sent(&radio).payload, Payload::SetSpeed { speed: 4 });
    }

    #[test]
    fn test_fan_settings_reply_publishes() {
        let start = Instant::now();
        let (mut controller, _radio, now) = idle_controller(start);
        controller.poll(now);
        transmit(&mut controller, now);

        receive(
            &mut controller,
            Frame::new(me(), main_unit(), Payload::FanSettings { speed: 2, voltage: 50, timer: 1 }),
            now,
        );

        assert_eq!(controller.state(), AppState::Idle);
        assert!(controller.link().is_idle());
        let state = FanState { on: true, speed: 2, voltage: 50, timer: true };
        assert_eq!(controller.fan_state(), state);
        assert_eq!(
            controller.drain_events(),
            vec![
                FanEvent::StateChanged(state),
                FanEvent::Sensor(SensorReading::VentilationPercentage(50)),
                FanEvent::Sensor(SensorReading::TimerActive(true)),
                FanEvent::Sensor(SensorReading::VentilationMode("Medium")),
            ]
        );
    }

    #[test]
    fn test_misaddressed_fan_settings_change_nothing() {
        let start = Instant::now();
        let (mut controller, _radio, now) = idle_controller(start);
        controller.poll(now);
        transmit(&mut controller, now);

        let other_remote = DeviceAddress::new(device_type::REMOTE_CONTROL, MY_ID + 1);
        receive(
            &mut controller,
            Frame::new(other_remote, main_unit(), Payload::FanSettings { speed: 4, voltage: 100, timer: 0 }),
            now,
        );

        assert_eq!(controller.state(), AppState::WaitFanSettings);
        assert_eq!(controller.link().state(), LinkState::RxWait);
        assert_eq!(controller.fan_state(), FanState::default());
        assert!(controller.drain_events().is_empty());
    }

    #[test]
    fn test_query_exhaustion_returns_to_idle() {
        let start = Instant::now();
        let settings = ControllerSettings { tx_retries: 0, ..settings() };
        let (mut controller, radio) = controller(store_with(Some(paired_session())), settings, start);
        let now = start + settings.startup_delay;
        controller.poll(now);
        controller.poll(now);
        transmit(&mut controller, now);

        controller.poll(now + REPLY_TIMEOUT + Duration::from_millis(1));
        assert_eq!(controller.state(), AppState::Idle);
        assert_eq!(radio.transmit_count(), 1);
        assert!(controller.drain_events().is_empty());
    }

    #[test]
    fn test_query_repeats_after_interval() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);
        controller.poll(now);
        transmit(&mut controller, now);
        receive(
            &mut controller,
            Frame::new(me(), main_unit(), Payload::FanSettings { speed: 1, voltage: 30, timer: 0 }),
            now,
        );

        controller.poll(now + Duration::from_secs(5));
        assert_eq!(controller.state(), AppState::Idle);

        controller.poll(now + settings().update_interval);
        assert_eq!(controller.state(), AppState::WaitFanSettings);
        assert_eq!(radio.loaded_frames().len(), 2);
    }

    #[test]
    fn test_malformed_frame_is_discarded() {
        let start = Instant::now();
        let (mut controller, _radio, now) = idle_controller(start);
        controller.poll(now);

        controller.on_receive(&[0x03, MY_ID, 0x01], now);
        assert_eq!(controller.state(), AppState::WaitFanSettings);
    }

    #[test]
    fn test_frames_in_idle_are_ignored() {
        let start = Instant::now();
        let (mut controller, _radio, now) = idle_controller(start);

        receive(
            &mut controller,
            Frame::new(me(), main_unit(), Payload::FanSettings { speed: 3, voltage: 90, timer: 0 }),
            now,
        );
        assert_eq!(controller.fan_state(), FanState::default());
        assert!(controller.drain_events().is_empty());
    }

    #[test]
    fn test_reset_pairing_restarts_discovery() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);
        controller.poll(now);
        assert_eq!(controller.state(), AppState::WaitFanSettings);

        controller.reset_pairing();
        assert_eq!(controller.state(), AppState::StartDiscovery);
        assert!(controller.link().is_idle());
        assert!(!controller.session().is_paired());

        controller.poll(now);
        assert_eq!(controller.state(), AppState::DiscoveryWaitForLinkRequest);
        assert_eq!(last_sent(&radio).payload, Payload::JoinRequest { network_id: 0 });
    }

    #[test]
    fn test_request_on_at_speed_zero_publishes_off() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);

        controller.request(true, 0);
        assert_eq!(
            controller.drain_events(),
            vec![FanEvent::StateChanged(FanState { on: false, speed: 0, voltage: 0, timer: false })]
        );

        controller.poll(now);
        assert_eq!(last_sent(&radio).payload, Payload::SetSpeed { speed: speed::AUTO });
    }

    #[test]
    fn test_rejected_discovery_broadcast_waits_for_backoff() {
        let start = Instant::now();
        let (mut controller, radio) = controller(store_with(None), settings(), start);
        let now = start + settings().startup_delay;
        radio.set_fail_load(true);

        controller.poll(now);
        assert_eq!(controller.state(), AppState::StartDiscovery);
        controller.poll(now);
        assert_eq!(controller.state(), AppState::StartDiscovery);
        assert!(radio.loaded_frames().is_empty());

        radio.set_fail_load(false);
        controller.poll(now + Duration::from_millis(500));
        assert_eq!(controller.state(), AppState::StartDiscovery);
        assert!(radio.loaded_frames().is_empty());

        controller.poll(now + settings().busy_backoff);
        assert_eq!(controller.state(), AppState::DiscoveryWaitForLinkRequest);
        assert_eq!(radio.loaded_frames().len(), 1);
        assert_eq!(last_sent(&radio).payload, Payload::JoinRequest { network_id: 0 });
    }

    #[test]
    fn test_busy_airway_during_set_speed_returns_to_idle() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);
        radio.set_busy(true);

        controller.request(true, 2);
        controller.poll(now);
        assert_eq!(controller.state(), AppState::WaitSetSpeedConfirm);

        let mut t = now;
        while controller.state() == AppState::WaitSetSpeedConfirm && t < now + Duration::from_secs(10) {
            t += Duration::from_millis(50);
            controller.poll(t);
        }

        assert_eq!(controller.state(), AppState::Idle);
        assert!(t.duration_since(now) > AIRWAY_TIMEOUT);
        assert!(controller.link().is_idle());
        assert_eq!(radio.transmit_count(), 0);
        assert_eq!(controller.pending(), None);
    }

    #[test]
    fn test_lost_transmit_complete_does_not_block_pending_command() {
        let start = Instant::now();
        let (mut controller, radio, now) = idle_controller(start);
        controller.poll(now);
        controller.poll(now);
        assert_eq!(controller.state(), AppState::WaitFanSettings);
        assert_eq!(controller.link().state(), LinkState::TxBusy);

        // The radio never reports anything as sent
        controller.request(true, 2);
        let mut t = now;
        while t < now + Duration::from_secs(60) {
            t += Duration::from_millis(10);
            controller.poll(t);
        }

        assert_eq!(controller.pending(), None);
        let sent_speed = radio
            .loaded_frames()
            .iter()
            .filter_map(|raw| decode_frame(raw).ok())
            .any(|frame| frame.payload == Payload::SetSpeed { speed: 2 });
        assert!(sent_speed);
    }
}
