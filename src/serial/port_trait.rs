//! Trait abstraction for the bridge's write side to enable testing

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio_serial::SerialStream;

/// Write side of the serial link to the bridge
#[async_trait]
pub trait SerialPortIO: Send {
    /// Write all data to the port
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    async fn flush(&mut self) -> io::Result<()>;
}

/// Any tokio writer, by default the write half of an opened serial port
pub struct TokioSerialPort<W = WriteHalf<SerialStream>> {
    port: W,
}

impl<W> TokioSerialPort<W> {
    pub fn new(port: W) -> Self {
        Self { port }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> SerialPortIO for TokioSerialPort<W> {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.port.flush().await
    }
}
