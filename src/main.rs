//! # Zehnder RF
//!
//! Pair with a Zehnder-style ventilation unit and control its fan through a
//! USB-serial radio bridge.
//!
//! Usage: `zehnder-rf [config.toml]`
//!
//! Commands on stdin:
//!
//! | Command | Effect |
//! |---------|--------|
//! | `on` | Fan on at the current (or highest) speed |
//! | `off` | Fan back to automatic mode |
//! | `speed N` | Fan on at speed preset N |
//! | `timer N MIN` | Speed preset N for MIN minutes |
//! | `status` | Log pairing and fan state |
//! | `pair` | Forget the pairing and search for a main unit |

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use zehnder_rf::config::{Config, LoggingConfig};
use zehnder_rf::fan::identity::{FixedIdentity, IdentitySource, RandomIdentity};
use zehnder_rf::fan::state::{speed_to_mode, FanEvent};
use zehnder_rf::fan::FanController;
use zehnder_rf::serial::{spawn_reader, BridgeEvent, BridgeRadio, BridgeSerial};
use zehnder_rf::session::store::JsonFileStore;
use zehnder_rf::telemetry::TelemetryLogger;

/// Engine tick; well below the 50 ms airway check interval
const TICK_INTERVAL_MS: u64 = 10;

/// Used when no path is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Bridge events buffered between the reader task and the main loop
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A line typed on stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UserCommand {
    On,
    Off,
    Speed(u8),
    Timer { speed: u8, minutes: u8 },
    Status,
    Pair,
}

fn parse_command(line: &str) -> Option<UserCommand> {
    let mut words = line.split_whitespace();
    let command = match words.next()?.to_ascii_lowercase().as_str() {
        "on" => UserCommand::On,
        "off" => UserCommand::Off,
        "speed" => UserCommand::Speed(words.next()?.parse().ok()?),
        "timer" => UserCommand::Timer {
            speed: words.next()?.parse().ok()?,
            minutes: words.next()?.parse().ok()?,
        },
        "status" => UserCommand::Status,
        "pair" => UserCommand::Pair,
        _ => return None,
    };

    if words.next().is_some() {
        return None;
    }
    Some(command)
}

/// Install the console subscriber, plus a daily log file when configured
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let (file_layer, guard) = match &config.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "zehnder-rf.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

fn load_config() -> Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => {
            Config::load(&path).with_context(|| format!("Failed to load configuration from {}", path))
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::load(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("Failed to load configuration from {}", DEFAULT_CONFIG_PATH)),
        None => Ok(Config::default()),
    }
}

fn handle_bridge_event(controller: &mut FanController<BridgeRadio>, event: BridgeEvent) {
    let now = Instant::now();
    controller.radio_mut().handle_event(&event);

    match event {
        BridgeEvent::Carrier(busy) => debug!("Airway {}", if busy { "busy" } else { "free" }),
        BridgeEvent::TxDone => controller.on_transmit_complete(now),
        BridgeEvent::Received(data) => controller.on_receive(&data, now),
    }
}

fn handle_command(controller: &mut FanController<BridgeRadio>, line: &str) {
    let Some(command) = parse_command(line) else {
        if !line.trim().is_empty() {
            warn!("Unknown command '{}' (on, off, speed N, timer N MIN, status, pair)", line.trim());
        }
        return;
    };

    match command {
        UserCommand::On => {
            let speed = match controller.fan_state().speed {
                0 => controller.settings().speed_count,
                speed => speed,
            };
            controller.request(true, speed);
        }
        UserCommand::Off => controller.request(false, 0),
        UserCommand::Speed(speed) => controller.request(speed > 0, speed),
        UserCommand::Timer { speed, minutes } => controller.request_timer(speed, minutes),
        UserCommand::Status => {
            let fan = controller.fan_state();
            info!(
                "State {:?}, paired: {}, network 0x{:08X}",
                controller.state(),
                controller.session().is_paired(),
                controller.session().network_id
            );
            info!(
                "Fan: on={} speed={} ({}) voltage={}% timer={}",
                fan.on,
                fan.speed,
                speed_to_mode(fan.speed),
                fan.voltage,
                fan.timer
            );
        }
        UserCommand::Pair => controller.reset_pairing(),
    }
}

fn publish(event: &FanEvent, telemetry: Option<&mut TelemetryLogger>) {
    match serde_json::to_string(event) {
        Ok(json) => info!("Publish: {}", json),
        Err(e) => warn!("Failed to serialize event: {}", e),
    }

    if let Some(logger) = telemetry {
        if let Err(e) = logger.log_event(event) {
            warn!("Failed to write telemetry: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;
    let _log_guard = init_logging(&config.logging);

    info!("Zehnder RF v{} starting...", env!("CARGO_PKG_VERSION"));

    let (mut serial, reader) = BridgeSerial::open(&config.serial.port, config.serial.baud_rate)?;
    info!("Radio bridge opened at: {}", serial.device_path());

    let (event_tx, mut bridge_events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let reader_task = spawn_reader(reader, event_tx);

    let mut telemetry = if config.telemetry.enabled {
        match TelemetryLogger::new(&config.telemetry) {
            Ok(logger) => Some(logger),
            Err(e) => {
                warn!("Telemetry disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let identity: Box<dyn IdentitySource> = match config.fan.identity_byte {
        Some(byte) => Box::new(FixedIdentity(byte)),
        None => Box::new(RandomIdentity),
    };
    let store = JsonFileStore::new(&config.storage.pairing_file);
    let settings = config.fan.controller_settings();
    info!(
        "Startup delay {:?}, update interval {:?}, pairing file {}",
        settings.startup_delay,
        settings.update_interval,
        store.path().display()
    );

    let mut controller =
        FanController::new(BridgeRadio::new(), Box::new(store), identity, settings, Instant::now());

    let mut tick = interval(Duration::from_millis(TICK_INTERVAL_MS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Press Ctrl+C to exit");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                controller.poll(Instant::now());
            }

            event = bridge_events.recv() => {
                match event {
                    Some(event) => handle_bridge_event(&mut controller, event),
                    None => anyhow::bail!("Radio bridge reader stopped"),
                }
            }

            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => handle_command(&mut controller, &line),
                    Ok(None) => {
                        debug!("stdin closed, commands disabled");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }

            // Handle Ctrl+C for graceful shutdown
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }

        serial
            .send_all(controller.radio_mut().take_outbound())
            .await
            .context("Failed to write to radio bridge")?;

        for event in controller.drain_events() {
            publish(&event, telemetry.as_mut());
        }
    }

    reader_task.abort();
    Ok(())
}
