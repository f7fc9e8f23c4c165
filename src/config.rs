//! Connection and protocol settings, loadable from a YAML file.
use crate::client::Rd60xx;
use crate::engine::{Modbus, DEFAULT_RETRIES, DEFAULT_WRITE_DELAY, ROBUST_RETRIES};
use crate::protocol::FACTORY_DEFAULT_UNIT;
use crate::store::{GapFill, RegisterStore, DEFAULT_STALENESS};
use crate::transport::{Transport, DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT, DEFAULT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;

/// Read timeout used in robust mode.
pub const ROBUST_TIMEOUT: Duration = Duration::from_secs(6);

/// A commented configuration file with every key at its default.
pub const TEMPLATE: &str = r#"# rd60 configuration
#
# Searched as ./rd60.yml, then in the user configuration directory
# (for example ~/.config/rd60/config.yml). Commandline options win.

# Serial port (USB) connection
connection:
  serial:
    device: /dev/ttyUSB0
    baud_rate: 115200

# or a serial-to-network bridge carrying raw RTU frames
#connection:
#  tcp:
#    host: 192.168.1.50
#    port: 8888

# Modbus unit address of the device
unit: 1

# Response timeout and attempts per exchange
timeout: 3s
retries: 10

# Longer timeout (6s) and more attempts (60) for flaky links
robust: false

# Pause before the first write, lets a busy device settle
write_delay: 20ms

# Age after which the state registers are read again
staleness: 1s

# Force battery charging registers on or off (detected when unset)
#battery: true

# Values written for untouched registers inside a combined write:
# "device" reads them first, "mirror" uses the last known values
gap_fill: device
"#;

/// How the device is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    Serial {
        #[serde(default = "default_device")]
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
}

impl Default for Connection {
    fn default() -> Self {
        Connection::Serial {
            device: default_device(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// Name of the default serial device.
pub fn default_device() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_unit() -> u8 {
    FACTORY_DEFAULT_UNIT
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_write_delay() -> Duration {
    DEFAULT_WRITE_DELAY
}

fn default_staleness() -> Duration {
    DEFAULT_STALENESS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: Connection,
    #[serde(default = "default_unit")]
    pub unit: u8,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default)]
    pub robust: bool,
    #[serde(default = "default_write_delay", with = "humantime_serde")]
    pub write_delay: Duration,
    #[serde(default = "default_staleness", with = "humantime_serde")]
    pub staleness: Duration,
    #[serde(default)]
    pub battery: Option<bool>,
    #[serde(default)]
    pub gap_fill: GapFill,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: Connection::default(),
            unit: default_unit(),
            timeout: default_timeout(),
            retries: default_retries(),
            robust: false,
            write_delay: default_write_delay(),
            staleness: default_staleness(),
            battery: None,
            gap_fill: GapFill::default(),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> serde_yaml::Result<Self> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_reader<R: Read>(reader: R) -> serde_yaml::Result<Self> {
        serde_yaml::from_reader(reader)
    }

    /// Response timeout, raised in robust mode.
    pub fn effective_timeout(&self) -> Duration {
        if self.robust {
            self.timeout.max(ROBUST_TIMEOUT)
        } else {
            self.timeout
        }
    }

    /// Attempts per exchange, raised in robust mode.
    pub fn effective_retries(&self) -> u32 {
        if self.robust {
            self.retries.max(ROBUST_RETRIES)
        } else {
            self.retries
        }
    }

    /// Creates the transport for the configured connection. Nothing is
    /// opened yet.
    pub fn transport(&self) -> crate::Result<Box<dyn Transport>> {
        let mut transport: Box<dyn Transport> = match &self.connection {
            #[cfg(feature = "serial")]
            Connection::Serial { device, baud_rate } => {
                Box::new(crate::transport::SerialTransport::new(device.clone(), *baud_rate))
            }
            #[cfg(not(feature = "serial"))]
            Connection::Serial { device, .. } => {
                return Err(crate::Error::ConnectFailed {
                    target: format!("{device} (built without serial support)"),
                    attempts: 0,
                })
            }
            #[cfg(feature = "tcp")]
            Connection::Tcp { host, port } => {
                Box::new(crate::transport::TcpTransport::new(host.clone(), *port))
            }
            #[cfg(not(feature = "tcp"))]
            Connection::Tcp { host, port } => {
                return Err(crate::Error::ConnectFailed {
                    target: format!("{host}:{port} (built without TCP support)"),
                    attempts: 0,
                })
            }
        };
        transport.set_timeout(self.effective_timeout());
        Ok(transport)
    }

    /// Wraps `transport` into a client with these settings.
    pub fn client<T: Transport>(&self, transport: T) -> Rd60xx<T> {
        let modbus = Modbus::new(transport, self.unit)
            .with_retries(self.effective_retries())
            .with_write_delay(self.write_delay);
        let store = RegisterStore::new(modbus)
            .with_staleness(self.staleness)
            .with_gap_fill(self.gap_fill)
            .with_battery_mode(self.battery);
        Rd60xx::new(store)
    }

    /// Creates a client for the configured connection.
    pub fn connect(&self) -> crate::Result<Rd60xx<Box<dyn Transport>>> {
        log::info!(
            "Using {:?}, unit {}, timeout {:?}, {} attempts",
            self.connection,
            self.unit,
            self.effective_timeout(),
            self.effective_retries()
        );
        Ok(self.client(self.transport()?))
    }
}
