//! # Link Layer Module
//!
//! Owns the transceiver for one transmit/reply cycle at a time.
//!
//! This module handles:
//! - Loading frames into the radio and waiting for a free airway
//! - Channel-access timeout (airway busy for more than 5 s)
//! - Transmit timeout (2000 ms) when the radio never reports a frame sent
//! - Reply timeout (2000 ms) with a retry budget and jittered resend delay
//! - Reporting exhaustion back to the application layer as data
//!
//! ## Cycle
//!
//! ```text
//! Idle -> WaitAirwayFree -> TxBusy -> RxWait -> Idle
//!              ^                        |
//!              +------ retry -----------+
//! ```
//!
//! The engine never sleeps. Every deadline is evaluated when the host calls
//! [`LinkEngine::poll`], and the retry jitter is a scheduled airway check.

pub mod radio;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Debug;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::error::{Result, ZehnderError};
use crate::frame::{encode_frame, Frame};
use radio::RadioDriver;

/// How long to wait for a reply after the frame left the radio
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(2000);

/// How long the airway may stay busy before the cycle is abandoned
pub const AIRWAY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the radio may take to report a frame sent
pub const TX_TIMEOUT: Duration = Duration::from_millis(2000);

/// Interval between airway checks while the channel is busy
pub const AIRWAY_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Fixed part of the delay before a retry
pub const RETRY_DELAY_MIN_MS: u64 = 150;

/// Random part of the delay before a retry
pub const RETRY_DELAY_JITTER_MS: u64 = 200;

/// Every frame is repeated this many times on air
pub const TX_REPEATS: u8 = 4;

/// Whether a cycle waits for a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Done as soon as the radio reports the frame sent
    FireAndForget,
    /// Wait for a reply, resending up to `retries` more times
    AwaitReply { retries: u8 },
}

/// Link layer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    WaitAirwayFree,
    TxBusy,
    RxWait,
}

/// Result of a transmit-complete notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    /// Fire-and-forget cycle finished; the link is idle again
    Delivered,
    /// Frame sent, reply timer running
    AwaitingReply,
}

/// A cycle that ended without success
#[derive(Debug)]
pub struct LinkTimeout<T> {
    /// `ChannelAccessTimeout`, `TransmitTimeout` or `ReplyExhausted`
    pub error: ZehnderError,
    /// Continuation registered with the cycle
    pub on_timeout: Option<T>,
}

#[derive(Debug)]
struct Cycle<T> {
    delivery: Delivery,
    on_timeout: Option<T>,
    airway_wait_start: Instant,
    next_airway_check: Instant,
    tx_started: Option<Instant>,
    sent_at: Option<Instant>,
}

/// Link-layer engine
///
/// `T` is the continuation handed back when a cycle times out. The
/// application layer uses its own state type so the fallback is plain data.
pub struct LinkEngine<R, T> {
    radio: R,
    state: LinkState,
    cycle: Option<Cycle<T>>,
    /// Start of a transmission cut short by `complete()`; its notification is still due
    stale_tx: Option<Instant>,
    rng: StdRng,
}

impl<R, T> std::fmt::Debug for LinkEngine<R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkEngine")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<R: RadioDriver, T: Copy + Debug> LinkEngine<R, T> {
    pub fn new(radio: R) -> Self {
        Self::with_rng(radio, StdRng::from_entropy())
    }

    /// Create an engine with a caller-supplied jitter source
    pub fn with_rng(radio: R, rng: StdRng) -> Self {
        Self {
            radio,
            state: LinkState::Idle,
            cycle: None,
            stale_tx: None,
            rng,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == LinkState::Idle
    }

    /// Retries left in the current cycle; `None` when idle or fire-and-forget
    pub fn retries_remaining(&self) -> Option<u8> {
        match self.cycle.as_ref()?.delivery {
            Delivery::AwaitReply { retries } => Some(retries),
            Delivery::FireAndForget => None,
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Start a new cycle
    ///
    /// # Errors
    ///
    /// - `Busy` if a cycle is already in flight; that cycle is left untouched
    /// - any error from loading the frame into the radio
    pub fn start_transmit(
        &mut self,
        frame: &Frame,
        delivery: Delivery,
        on_timeout: Option<T>,
        now: Instant,
    ) -> Result<()> {
        if self.state != LinkState::Idle {
            warn!("TX still ongoing, rejecting command 0x{:02X}", frame.command());
            return Err(ZehnderError::Busy);
        }

        self.radio.load_payload(&encode_frame(frame))?;
        debug!(
            "Loaded command 0x{:02X} for 0x{:02X}/0x{:02X} ({:?})",
            frame.command(),
            frame.rx_type,
            frame.rx_id,
            delivery
        );

        self.cycle = Some(Cycle {
            delivery,
            on_timeout,
            airway_wait_start: now,
            next_airway_check: now,
            tx_started: None,
            sent_at: None,
        });
        self.state = LinkState::WaitAirwayFree;
        Ok(())
    }

    /// Advance time-driven transitions; call on every tick
    ///
    /// Returns the timed-out cycle's continuation when a cycle is abandoned.
    pub fn poll(&mut self, now: Instant) -> Option<LinkTimeout<T>> {
        match self.state {
            LinkState::Idle => None,
            LinkState::WaitAirwayFree => self.poll_airway(now),
            LinkState::TxBusy => self.poll_transmit(now),
            LinkState::RxWait => self.poll_reply(now),
        }
    }

    fn poll_airway(&mut self, now: Instant) -> Option<LinkTimeout<T>> {
        let Some(cycle) = self.cycle.as_mut() else {
            self.state = LinkState::Idle;
            return None;
        };

        if now < cycle.next_airway_check {
            return None;
        }

        if !self.radio.channel_busy() {
            match self.radio.start_transmit(TX_REPEATS) {
                Ok(()) => {
                    debug!("Airway free, starting transmission");
                    cycle.tx_started = Some(now);
                    self.state = LinkState::TxBusy;
                    return None;
                }
                Err(e) => warn!("Failed to start transmission: {}", e),
            }
        }

        if now.duration_since(cycle.airway_wait_start) > AIRWAY_TIMEOUT {
            warn!("Airway too busy, giving up");
            return Some(self.abandon(ZehnderError::ChannelAccessTimeout));
        }

        trace!("Airway busy, waiting...");
        cycle.next_airway_check = now + AIRWAY_CHECK_INTERVAL;
        None
    }

    fn poll_transmit(&mut self, now: Instant) -> Option<LinkTimeout<T>> {
        let Some(cycle) = self.cycle.as_mut() else {
            self.state = LinkState::Idle;
            return None;
        };
        let started = *cycle.tx_started.get_or_insert(now);

        if now.duration_since(started) <= TX_TIMEOUT {
            return None;
        }

        warn!("Radio never reported the transmission complete");
        self.retry_or_abandon(now, ZehnderError::TransmitTimeout)
    }

    fn poll_reply(&mut self, now: Instant) -> Option<LinkTimeout<T>> {
        let Some(cycle) = self.cycle.as_mut() else {
            self.state = LinkState::Idle;
            return None;
        };
        let sent_at = *cycle.sent_at.get_or_insert(now);

        if now.duration_since(sent_at) <= REPLY_TIMEOUT {
            return None;
        }

        debug!("No reply received");
        self.retry_or_abandon(now, ZehnderError::ReplyExhausted)
    }

    /// Resend after a jittered delay if retries remain, else end the cycle with `error`
    fn retry_or_abandon(&mut self, now: Instant, error: ZehnderError) -> Option<LinkTimeout<T>> {
        let Some(cycle) = self.cycle.as_mut() else {
            self.state = LinkState::Idle;
            return None;
        };

        let delivery = cycle.delivery;
        match delivery {
            Delivery::AwaitReply { retries } if retries > 0 => {
                let delay = Duration::from_millis(
                    RETRY_DELAY_MIN_MS + self.rng.gen_range(0..RETRY_DELAY_JITTER_MS),
                );
                cycle.delivery = Delivery::AwaitReply { retries: retries - 1 };
                cycle.tx_started = None;
                cycle.sent_at = None;
                cycle.airway_wait_start = now;
                cycle.next_airway_check = now + delay;
                self.state = LinkState::WaitAirwayFree;
                debug!("Retrying in {:?} (left: {})", delay, retries - 1);
                None
            }
            _ => {
                debug!("Giving up: {}", error);
                Some(self.abandon(error))
            }
        }
    }

    /// Radio reported the loaded frame as sent
    pub fn on_transmit_complete(&mut self, now: Instant) -> Option<TxOutcome> {
        if let Some(started) = self.stale_tx.take() {
            if now.duration_since(started) <= TX_TIMEOUT {
                debug!("Transmit complete for an ended cycle, ignored");
                return None;
            }
        }

        if self.state != LinkState::TxBusy {
            debug!("Transmit complete in {:?}, ignored", self.state);
            return None;
        }

        let delivery = self.cycle.as_ref().map(|c| c.delivery);
        match delivery {
            Some(Delivery::AwaitReply { .. }) => {
                if let Some(cycle) = self.cycle.as_mut() {
                    cycle.sent_at = Some(now);
                }
                self.state = LinkState::RxWait;
                Some(TxOutcome::AwaitingReply)
            }
            _ => {
                self.cycle = None;
                self.state = LinkState::Idle;
                Some(TxOutcome::Delivered)
            }
        }
    }

    /// End the current cycle; its timeout continuation is dropped
    ///
    /// Ending a cycle mid-transmission leaves one transmit-complete
    /// notification outstanding; it is discarded when it arrives.
    pub fn complete(&mut self) {
        if self.state == LinkState::TxBusy {
            self.stale_tx = self.cycle.as_ref().and_then(|c| c.tx_started);
        }
        self.cycle = None;
        self.state = LinkState::Idle;
    }

    fn abandon(&mut self, error: ZehnderError) -> LinkTimeout<T> {
        let on_timeout = self.cycle.take().and_then(|c| c.on_timeout);
        self.state = LinkState::Idle;
        LinkTimeout { error, on_timeout }
    }
}
