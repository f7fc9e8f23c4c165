//! A library for controlling Riden RD60xx power supplies over their Modbus
//! RTU register interface.
//!
//! The device is reached through a USB serial port or through a
//! serial-to-network bridge that forwards raw RTU frames over TCP. The crate
//! is layered bottom-up:
//!
//! 1.  **Framing**: [`crc`] and [`protocol`] build and validate RTU frames for
//!     the three register function codes the device speaks.
//! 2.  **Transport**: [`transport`] moves bytes over a serial port or a socket
//!     and reconnects on its own.
//! 3.  **Transactions**: [`engine::Modbus`] performs request/response
//!     exchanges with a bounded number of attempts.
//! 4.  **Register store**: [`store::RegisterStore`] mirrors the device
//!     registers, coalesces cached writes and re-reads the state only when it
//!     may have changed.
//! 5.  **Client**: [`client::Rd60xx`] converts between raw registers and volts
//!     or amps using the model [`profile`] detected at connection time.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rd60xx_lib::client::Rd60xx;
//! use rd60xx_lib::engine::Modbus;
//! use rd60xx_lib::store::RegisterStore;
//! use rd60xx_lib::transport::TcpTransport;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = TcpTransport::new("192.168.1.50", 8888);
//!     let mut psu = Rd60xx::new(RegisterStore::new(Modbus::new(transport, 1)));
//!
//!     println!("Connected to {}", psu.device_info()?);
//!     psu.set_voltage(12.0, false)?;
//!     psu.set_current(0.5, false)?;
//!     psu.set_output_enabled(true)?;
//!
//!     let state = psu.state()?;
//!     println!("{} V, {} A", state.voltage_out, state.current_out);
//!     Ok(())
//! }
//! ```
//!
//! Errors that leave the device state unknown (see [`Error::is_fatal`]) end the
//! session: the client refuses every further exchange.

pub mod client;
pub mod crc;
pub mod engine;
mod error;
pub mod profile;
pub mod protocol;
pub mod registers;
pub mod store;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
#[cfg(feature = "serde")]
pub mod config;

#[cfg(test)]
mod mock;

pub use error::{Error, Result};
