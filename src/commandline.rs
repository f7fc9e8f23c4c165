use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rd60xx_lib::registers::{RegisterRef, PRESET_COUNT};
use rd60xx_lib::transport::{DEFAULT_BAUD_RATE, DEFAULT_TCP_PORT};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Host and port of a serial-to-network bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTarget {
    pub host: String,
    pub port: u16,
}

/// Serial device and baud rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialTarget {
    pub device: String,
    pub baud_rate: u32,
}

/// A set-point, absolute or relative to the current value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetValue {
    pub value: f64,
    pub relative: bool,
}

fn parse_tcp_target(s: &str) -> Result<TcpTarget, String> {
    match s.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(String::from("Missing host name"));
            }
            let port = port
                .parse::<u16>()
                .map_err(|e| format!("Invalid port number format: {e}"))?;
            Ok(TcpTarget {
                host: host.to_string(),
                port,
            })
        }
        _ => Ok(TcpTarget {
            host: s.to_string(),
            port: DEFAULT_TCP_PORT,
        }),
    }
}

fn parse_serial_target(s: &str) -> Result<SerialTarget, String> {
    match s.rsplit_once('@') {
        Some((device, baud_rate)) => {
            let baud_rate = baud_rate
                .parse::<u32>()
                .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
            Ok(SerialTarget {
                device: device.to_string(),
                baud_rate,
            })
        }
        None => Ok(SerialTarget {
            device: s.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }),
    }
}

fn parse_unit(s: &str) -> Result<u8, String> {
    let unit = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    if !(1..=247).contains(&unit) {
        return Err(format!("Address {unit} out of range (1-247)"));
    }
    Ok(unit)
}

fn parse_register(s: &str) -> Result<RegisterRef, String> {
    RegisterRef::from_str(s).map_err(|e| e.to_string())
}

fn parse_register_value(s: &str) -> Result<u16, String> {
    clap_num::maybe_hex::<u16>(s).map_err(|e| format!("Invalid register value format: {e}"))
}

fn parse_set_value(s: &str) -> Result<SetValue, String> {
    let s = s.trim();
    let value = s
        .parse::<f64>()
        .map_err(|e| format!("Invalid number format: {e}"))?;
    if !value.is_finite() {
        return Err(format!("Invalid value {s}"));
    }
    Ok(SetValue {
        value,
        relative: s.starts_with('+') || s.starts_with('-'),
    })
}

fn parse_preset_index(s: &str) -> Result<u8, String> {
    let index = s
        .parse::<u8>()
        .map_err(|e| format!("Invalid preset number format: {e}"))?;
    if index >= PRESET_COUNT {
        return Err(format!("Preset {index} out of range (0-{})", PRESET_COUNT - 1));
    }
    Ok(index)
}

/// Single measured or set values for `query`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Output voltage in volts.
    Voltage,
    /// Output current in amps.
    Current,
    /// Battery voltage in volts.
    BatteryVoltage,
    /// Output voltage in integer millivolts.
    Millivolts,
    /// Output current in integer milliamps.
    Milliamps,
    /// Internal temperature in °C.
    InternalTemp,
    /// External sensor temperature in °C.
    ExternalTemp,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Print set-points and measurements.
    State {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
        /// Only output voltage and current (and battery voltage).
        #[arg(long)]
        short: bool,
        /// Include the local time.
        #[arg(long)]
        time: bool,
        /// Include the UTC time.
        #[arg(long)]
        utc: bool,
    },

    /// Print a single value, suitable for scripts.
    Query {
        #[arg(value_enum)]
        quantity: Quantity,
    },

    /// Print registers given by name (e.g. "V_SET") or decimal address.
    Get {
        #[arg(required = true, value_parser = parse_register)]
        registers: Vec<RegisterRef>,
    },

    /// Change set-points; all changes are written together.
    /// Values starting with "+" or "-" are added to the current value.
    /// Example: `rd60 set --voltage 12 --current +0.1 --on`
    #[clap(verbatim_doc_comment)]
    Set {
        /// Output voltage in volts.
        #[arg(long, value_parser = parse_set_value, allow_hyphen_values = true)]
        voltage: Option<SetValue>,
        /// Output current limit in amps.
        #[arg(long, value_parser = parse_set_value, allow_hyphen_values = true)]
        current: Option<SetValue>,
        /// Over-voltage protection in volts.
        #[arg(long, value_parser = parse_set_value, allow_hyphen_values = true)]
        ovp: Option<SetValue>,
        /// Over-current protection in amps.
        #[arg(long, value_parser = parse_set_value, allow_hyphen_values = true)]
        ocp: Option<SetValue>,
        /// Enable the output afterwards.
        #[arg(long, conflicts_with = "off")]
        on: bool,
        /// Disable the output afterwards.
        #[arg(long)]
        off: bool,
    },

    /// Enable the output.
    On,

    /// Disable the output.
    Off,

    /// Toggle the output.
    Toggle,

    /// Write a raw value into a register immediately.
    /// **Caution:** calibration registers (55-62) can ruin the accuracy of the device.
    #[clap(verbatim_doc_comment)]
    WriteReg {
        /// Register name or decimal address.
        #[arg(value_parser = parse_register)]
        register: RegisterRef,
        /// Raw value, decimal or hexadecimal (e.g. "0x1F4").
        #[arg(value_parser = parse_register_value)]
        value: u16,
        /// Do not ask for confirmation.
        #[arg(long)]
        yes: bool,
    },

    /// Dump the state registers.
    Regs {
        /// Include presets and calibration (registers 0-119).
        #[arg(long, conflicts_with = "count")]
        all: bool,
        /// Number of registers to dump, starting at 0.
        #[arg(long)]
        count: Option<usize>,
    },

    /// Print the preset memories M0-M9.
    Presets,

    /// Store volts and amps into a preset memory.
    SetPreset {
        /// Preset number (0-9). M0 is the active setting.
        #[arg(value_parser = parse_preset_index)]
        index: u8,
        voltage: f64,
        current: f64,
        ovp: f64,
        ocp: f64,
    },

    /// Set the device clock to the local time.
    SetClock,

    /// Print the detected device type.
    Type,

    /// Repeatedly print the state, or the changed registers with `--diff`.
    Watch {
        /// Time between two polls (e.g., "1s", "500ms").
        #[arg(long, value_parser = humantime::parse_duration, default_value = "1s")]
        interval: Duration,
        /// Stop after this many polls.
        #[arg(long)]
        count: Option<u64>,
        /// Print changed registers instead of the state.
        #[arg(long)]
        diff: bool,
    },

    /// Print a configuration file template.
    ConfigTemplate,
}

const fn about_text() -> &'static str {
    "Riden RD60xx power supply CLI - Control RD60xx power supplies via Modbus RTU over USB or TCP."
}

#[derive(Parser, Debug)]
#[command(
    name = "rd60",
    author,
    version,
    about = about_text(),
    long_about = None,
    propagate_version = true
)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace (every frame). Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Command to execute.
    #[command(subcommand)]
    pub command: CliCommands,

    /// Configuration file. Default: ./rd60.yml or the user configuration directory.
    #[arg(global = true, long)]
    pub config: Option<PathBuf>,

    /// Connect to a serial-to-network bridge.
    /// Example: "192.168.1.50" or "psu.local:8888".
    #[arg(
        global = true,
        long,
        value_parser = parse_tcp_target,
        conflicts_with = "serial",
        verbatim_doc_comment
    )]
    pub tcp: Option<TcpTarget>,

    /// Connect to a serial port.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3@115200" (Windows).
    #[arg(global = true, long, value_parser = parse_serial_target, verbatim_doc_comment)]
    pub serial: Option<SerialTarget>,

    /// Modbus unit address of the device (1-247).
    #[arg(global = true, long, value_parser = parse_unit)]
    pub unit: Option<u8>,

    /// Response timeout per attempt.
    /// Examples: "3s", "500ms".
    #[arg(global = true, long, value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Option<Duration>,

    /// Attempts per exchange before giving up.
    #[arg(global = true, long)]
    pub retries: Option<u32>,

    /// Longer timeout and more attempts for unreliable links.
    #[arg(global = true, long)]
    pub robust: bool,

    /// Always read the battery charging registers.
    #[arg(global = true, long, conflicts_with = "no_battery")]
    pub battery: bool,

    /// Never read the battery charging registers.
    #[arg(global = true, long)]
    pub no_battery: bool,
}

impl CliArgs {
    /// Battery mode forced on the commandline, if any.
    pub fn battery_mode(&self) -> Option<bool> {
        match (self.battery, self.no_battery) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}
