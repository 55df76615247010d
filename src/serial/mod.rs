//! # Serial Communication Module
//!
//! Handles serial communication with the USB radio bridge.
//!
//! This module handles:
//! - Opening the bridge's serial port (8N1, no flow control)
//! - Writing bridge commands queued by [`BridgeRadio`]
//! - Reading and decoding bridge events in a background task

pub mod bridge;
pub mod port_trait;
pub mod protocol;

pub use bridge::BridgeRadio;
pub use protocol::{BridgeCommand, BridgeEvent};

use crate::error::{Result, ZehnderError};
use port_trait::{SerialPortIO, TokioSerialPort};
use protocol::BridgeDecoder;
use tokio::io::{AsyncRead, AsyncReadExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Bridge device paths tried after the configured one
const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyACM0", // USB CDC bridges
    "/dev/ttyUSB0", // USB-to-serial adapters
];

/// Read buffer size for the event reader
const READ_BUFFER_SIZE: usize = 256;

/// Write side of the connection to the radio bridge
pub struct BridgeSerial {
    port: Box<dyn SerialPortIO>,
    device_path: String,
}

impl std::fmt::Debug for BridgeSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl BridgeSerial {
    /// Wrap an already open writer
    pub fn new(port: Box<dyn SerialPortIO>, device_path: impl Into<String>) -> Self {
        Self {
            port,
            device_path: device_path.into(),
        }
    }

    /// Open the bridge at `path`, falling back to the common device paths
    ///
    /// Returns the writer and the read half for [`spawn_reader`].
    ///
    /// # Errors
    ///
    /// Returns `SerialPortNotFound` if no candidate path could be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use zehnder_rf::serial::BridgeSerial;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let (serial, reader) = BridgeSerial::open("/dev/ttyACM0", 115200)?;
    ///     println!("Connected to: {}", serial.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(path: &str, baud_rate: u32) -> Result<(Self, ReadHalf<SerialStream>)> {
        let mut paths = vec![path];
        paths.extend(DEFAULT_DEVICE_PATHS.iter().copied().filter(|p| *p != path));
        Self::open_with_paths(&paths, baud_rate)
    }

    /// Open the first path in `paths` that works
    pub fn open_with_paths(
        paths: &[&str],
        baud_rate: u32,
    ) -> Result<(Self, ReadHalf<SerialStream>)> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(stream) => {
                    info!("Opened radio bridge at {} ({} baud)", path, baud_rate);
                    let (reader, writer) = tokio::io::split(stream);
                    let serial = Self::new(Box::new(TokioSerialPort::new(writer)), *path);
                    return Ok((serial, reader));
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(ZehnderError::SerialPortNotFound(paths.join(", ")))
    }

    fn open_port(path: &str, baud_rate: u32) -> Result<SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ZehnderError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Write one command to the bridge
    pub async fn send(&mut self, command: &BridgeCommand) -> Result<()> {
        self.port
            .write_all(&command.encode())
            .await
            .map_err(|e| ZehnderError::Serial(format!("Failed to write command: {}", e)))?;

        debug!("Sent bridge command 0x{:02X}", command.kind());
        Ok(())
    }

    /// Write commands in order, then flush once
    pub async fn send_all<I>(&mut self, commands: I) -> Result<()>
    where
        I: IntoIterator<Item = BridgeCommand>,
    {
        let mut sent = 0usize;
        for command in commands {
            self.send(&command).await?;
            sent += 1;
        }

        if sent > 0 {
            self.port
                .flush()
                .await
                .map_err(|e| ZehnderError::Serial(format!("Failed to flush serial port: {}", e)))?;
        }
        Ok(())
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

/// Decode bridge events from `reader` until it closes
///
/// The task ends on EOF, on a read error, or when the receiver is dropped.
pub fn spawn_reader<R>(mut reader: R, events: mpsc::Sender<BridgeEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut decoder = BridgeDecoder::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    warn!("Radio bridge closed the connection");
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Failed to read from radio bridge: {}", e);
                    return;
                }
            };

            decoder.push(&buf[..n]);
            while let Some(event) = decoder.next_event() {
                if events.send(event).await.is_err() {
                    debug!("Event receiver dropped, stopping bridge reader");
                    return;
                }
            }
        }
    })
}
