//! Byte channels to the device.
//!
//! A [`Transport`] moves raw bytes and knows nothing about frames. Both
//! implementations honor a read timeout and retry their own connection a
//! bounded number of times before giving up with [`Error::ConnectFailed`].
//! The RTU frame is sent unchanged over TCP (serial-to-WiFi bridges), there
//! is no MBAP header.
use crate::{Error, Result};
use std::time::Duration;

/// Default read timeout of both transports.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
/// Connection attempts before a transport gives up.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
/// Default TCP port of RD60xx WiFi bridges.
pub const DEFAULT_TCP_PORT: u16 = 8888;
/// Default serial baud rate of the RD60xx USB interface.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// A byte-oriented, exclusively owned channel to one device.
pub trait Transport {
    /// Opens the channel. Retries internally and fails only when every
    /// attempt failed.
    fn connect(&mut self) -> Result<()>;

    /// Closes the channel. Closing a closed channel does nothing.
    fn close(&mut self);

    fn is_connected(&self) -> bool;

    /// Sends all bytes.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receives at most `max_len` bytes. Returns fewer bytes (possibly none)
    /// when the timeout expires first.
    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>>;

    /// Discards everything currently buffered on the input side and returns
    /// the number of discarded bytes.
    fn flush_input(&mut self) -> Result<usize>;

    fn set_timeout(&mut self, timeout: Duration);

    /// Human readable description of the peer, for log messages.
    fn describe(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
        (**self).receive(max_len)
    }

    fn flush_input(&mut self) -> Result<usize> {
        (**self).flush_input()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        (**self).set_timeout(timeout)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

#[cfg(feature = "serial")]
pub use serial::{serial_port_builder, SerialTransport};

#[cfg(feature = "serial")]
mod serial {
    use super::*;
    use std::io::{ErrorKind, Read, Write};

    /// The parity used for serial communication.
    pub const PARITY: &tokio_serial::Parity = &tokio_serial::Parity::None;
    /// The number of stop bits used for serial communication.
    pub const STOP_BITS: &tokio_serial::StopBits = &tokio_serial::StopBits::One;
    /// The number of data bits used for serial communication.
    pub const DATA_BITS: &tokio_serial::DataBits = &tokio_serial::DataBits::Eight;

    /// Delay between two attempts to open the port.
    const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);

    fn is_timeout(error: &std::io::Error) -> bool {
        matches!(error.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
    }

    /// Creates a `tokio_serial::SerialPortBuilder` with the device settings (8N1).
    ///
    /// # Arguments
    ///
    /// * `device` - The path to the serial port device (e.g., `/dev/ttyUSB0`).
    /// * `baud_rate` - The baud rate for the serial communication.
    pub fn serial_port_builder(device: &str, baud_rate: u32) -> tokio_serial::SerialPortBuilder {
        tokio_serial::new(device, baud_rate)
            .parity(*PARITY)
            .stop_bits(*STOP_BITS)
            .data_bits(*DATA_BITS)
            .flow_control(tokio_serial::FlowControl::None)
    }

    /// Blocking serial port transport.
    pub struct SerialTransport {
        device: String,
        baud_rate: u32,
        timeout: Duration,
        connect_attempts: u32,
        port: Option<Box<dyn tokio_serial::SerialPort>>,
    }

    impl SerialTransport {
        pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
            Self {
                device: device.into(),
                baud_rate,
                timeout: DEFAULT_TIMEOUT,
                connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
                port: None,
            }
        }

        pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
            self.connect_attempts = attempts.max(1);
            self
        }

        fn port(&mut self) -> Result<&mut Box<dyn tokio_serial::SerialPort>> {
            if self.port.is_none() {
                self.connect()?;
            }
            self.port.as_mut().ok_or(Error::NoResponse)
        }
    }

    impl Transport for SerialTransport {
        fn connect(&mut self) -> Result<()> {
            log::debug!("Opening serial port {} @ {}", self.device, self.baud_rate);
            for attempt in 0..self.connect_attempts {
                if attempt > 0 {
                    log::info!("Retrying to open {} ({attempt})...", self.device);
                }
                match serial_port_builder(&self.device, self.baud_rate)
                    .timeout(self.timeout)
                    .open()
                {
                    Ok(port) => {
                        self.port = Some(port);
                        log::debug!("Serial port {} opened", self.device);
                        return Ok(());
                    }
                    Err(error) => {
                        log::warn!("Cannot open serial port {}: {error}", self.device);
                        std::thread::sleep(OPEN_RETRY_DELAY);
                    }
                }
            }
            Err(Error::ConnectFailed {
                target: self.describe(),
                attempts: self.connect_attempts,
            })
        }

        fn close(&mut self) {
            if self.port.take().is_some() {
                log::debug!("Serial port {} closed", self.device);
            }
        }

        fn is_connected(&self) -> bool {
            self.port.is_some()
        }

        fn send(&mut self, data: &[u8]) -> Result<()> {
            let port = self.port()?;
            port.write_all(data)?;
            port.flush()?;
            Ok(())
        }

        fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
            let port = self.port()?;
            let mut buffer = vec![0u8; max_len];
            match port.read(&mut buffer) {
                Ok(received) => {
                    buffer.truncate(received);
                    Ok(buffer)
                }
                Err(error) if is_timeout(&error) => Ok(Vec::new()),
                Err(error) => Err(error.into()),
            }
        }

        fn flush_input(&mut self) -> Result<usize> {
            let port = self.port()?;
            let pending = port.bytes_to_read()? as usize;
            port.clear(tokio_serial::ClearBuffer::Input)?;
            Ok(pending)
        }

        fn set_timeout(&mut self, timeout: Duration) {
            self.timeout = timeout;
            if let Some(port) = self.port.as_mut() {
                if let Err(error) = port.set_timeout(timeout) {
                    log::warn!("Cannot set serial timeout: {error}");
                }
            }
        }

        fn describe(&self) -> String {
            format!("{}@{}", self.device, self.baud_rate)
        }
    }
}

#[cfg(feature = "tcp")]
pub use tcp::TcpTransport;

#[cfg(feature = "tcp")]
mod tcp {
    use super::*;
    use std::io::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::runtime::Runtime;
    use tokio::time::timeout;

    /// TCP socket transport for serial-to-network bridges.
    ///
    /// The socket is driven by a single-threaded tokio runtime owned by the
    /// transport. Every call blocks until it completes or its timeout expires.
    pub struct TcpTransport {
        host: String,
        port: u16,
        timeout: Duration,
        flush_timeout: Duration,
        connect_attempts: u32,
        reconnect: bool,
        // Dropped before the runtime it is registered with.
        stream: Option<TcpStream>,
        runtime: Option<Runtime>,
    }

    impl TcpTransport {
        /// Read timeout used while draining stale input.
        pub const FLUSH_TIMEOUT: Duration = Duration::from_millis(20);

        pub fn new(host: impl Into<String>, port: u16) -> Self {
            Self {
                host: host.into(),
                port,
                timeout: DEFAULT_TIMEOUT,
                flush_timeout: Self::FLUSH_TIMEOUT,
                connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
                reconnect: true,
                stream: None,
                runtime: None,
            }
        }

        pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
            self.connect_attempts = attempts.max(1);
            self
        }

        /// Disables the transparent reconnect after a stream error.
        pub fn without_reconnect(mut self) -> Self {
            self.reconnect = false;
            self
        }

        fn try_connect(&mut self) -> std::io::Result<()> {
            let runtime = match self.runtime.take() {
                Some(runtime) => runtime,
                None => tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?,
            };
            let result = runtime.block_on(timeout(
                self.timeout,
                TcpStream::connect((self.host.as_str(), self.port)),
            ));
            self.runtime = Some(runtime);
            let stream = result
                .map_err(|_| std::io::Error::new(ErrorKind::TimedOut, "connect timed out"))??;
            stream.set_nodelay(true)?;
            self.stream = Some(stream);
            Ok(())
        }

        /// The runtime and the stream, connecting first if needed.
        fn parts(&mut self) -> Result<(&Runtime, &mut TcpStream)> {
            if self.stream.is_none() {
                self.connect()?;
            }
            match (self.runtime.as_ref(), self.stream.as_mut()) {
                (Some(runtime), Some(stream)) => Ok((runtime, stream)),
                _ => Err(Error::NoResponse),
            }
        }

        /// Handles a stream level error: reconnects if enabled and reports the
        /// I/O error so the current exchange counts as failed.
        fn recover(&mut self, error: std::io::Error) -> Error {
            log::warn!("Socket error on {}: {error}", self.describe());
            self.close();
            if self.reconnect {
                if let Err(fatal) = self.connect() {
                    return fatal;
                }
            }
            Error::Io(error)
        }
    }

    impl Transport for TcpTransport {
        fn connect(&mut self) -> Result<()> {
            log::debug!("Connecting to {}", self.describe());
            for attempt in 0..self.connect_attempts {
                if attempt > 0 {
                    log::info!("Connection retrying ({attempt})...");
                }
                match self.try_connect() {
                    Ok(()) => {
                        log::debug!("Connected to {}", self.describe());
                        return Ok(());
                    }
                    Err(error) => {
                        log::warn!("Cannot connect to {}: {error}", self.describe());
                        let delay = Duration::from_millis(500 + 1000 * attempt as u64)
                            .min(Duration::from_secs(5));
                        std::thread::sleep(delay);
                    }
                }
            }
            Err(Error::ConnectFailed {
                target: self.describe(),
                attempts: self.connect_attempts,
            })
        }

        fn close(&mut self) {
            if let Some(mut stream) = self.stream.take() {
                if let Some(runtime) = self.runtime.as_ref() {
                    let _ = runtime.block_on(timeout(self.flush_timeout, stream.shutdown()));
                }
                log::debug!("Socket {} closed", self.describe());
            }
        }

        fn is_connected(&self) -> bool {
            self.stream.is_some()
        }

        fn send(&mut self, data: &[u8]) -> Result<()> {
            let limit = self.timeout;
            let (runtime, stream) = self.parts()?;
            match runtime.block_on(timeout(limit, stream.write_all(data))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(error)) => Err(self.recover(error)),
                Err(_) => Err(self.recover(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "send timed out",
                ))),
            }
        }

        fn receive(&mut self, max_len: usize) -> Result<Vec<u8>> {
            let limit = self.timeout;
            let mut buffer = vec![0u8; max_len];
            let (runtime, stream) = self.parts()?;
            match runtime.block_on(timeout(limit, stream.read(&mut buffer))) {
                Ok(Ok(0)) if max_len > 0 => Err(self.recover(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))),
                Ok(Ok(received)) => {
                    buffer.truncate(received);
                    Ok(buffer)
                }
                Ok(Err(error)) => Err(self.recover(error)),
                Err(_) => Ok(Vec::new()),
            }
        }

        fn flush_input(&mut self) -> Result<usize> {
            let limit = self.flush_timeout;
            let (runtime, stream) = self.parts()?;
            let mut discarded = 0;
            let mut buffer = [0u8; 1024];
            let result = loop {
                match runtime.block_on(timeout(limit, stream.read(&mut buffer))) {
                    Ok(Ok(0)) | Err(_) => break Ok(()),
                    Ok(Ok(received)) => discarded += received,
                    Ok(Err(error)) => break Err(error),
                }
            };
            result.map_err(|error| self.recover(error))?;
            Ok(discarded)
        }

        fn set_timeout(&mut self, timeout: Duration) {
            self.timeout = timeout;
        }

        fn describe(&self) -> String {
            format!("{}:{}", self.host, self.port)
        }
    }

}
