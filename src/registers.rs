//! Register map of the RD60xx family.
//!
//! The device exposes a flat space of 16-bit holding registers. The map below
//! is static: names resolve to fixed addresses and never change at runtime.
use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Well-known register addresses.
pub mod addr {
    pub const ID: u16 = 0;
    pub const SN_H: u16 = 1;
    pub const FW: u16 = 3;
    pub const INT_C: u16 = 5;
    pub const V_SET: u16 = 8;
    pub const I_SET: u16 = 9;
    pub const V_OUT: u16 = 10;
    pub const I_OUT: u16 = 11;
    pub const P_OUT: u16 = 13;
    pub const V_IN: u16 = 14;
    pub const KEYPAD: u16 = 15;
    pub const OVP_OCP: u16 = 16;
    pub const CV_CC: u16 = 17;
    pub const OUTPUT: u16 = 18;
    pub const PRESET: u16 = 19;
    pub const I_RANGE: u16 = 20;
    pub const BAT_MODE: u16 = 32;
    pub const V_BAT: u16 = 33;
    pub const EXT_C_S: u16 = 34;
    pub const EXT_C: u16 = 35;
    pub const EXT_F: u16 = 37;
    pub const AH_H: u16 = 38;
    pub const WH_H: u16 = 40;
    pub const YEAR: u16 = 48;
    pub const M0_V: u16 = 80;
    pub const M0_OVP: u16 = 82;
    pub const M0_OCP: u16 = 83;
}

/// Number of registers in the live state block (addresses 0 to 41).
pub const STATE_BLOCK_LENGTH: u16 = 42;

/// Identity, serial number and firmware never change; re-reads start here.
pub const STATE_RESYNC_START: u16 = 4;

/// End (exclusive) of the state block re-read when battery mode is off.
/// It still covers the current range selector.
pub const REDUCED_STATE_END: u16 = addr::I_RANGE + 1;

/// Number of clock registers (year, month, day, hour, minute, second).
pub const CLOCK_LENGTH: usize = 6;

/// Clock registers.
pub const CLOCK: std::ops::RangeInclusive<u16> = addr::YEAR..=addr::YEAR + CLOCK_LENGTH as u16 - 1;

/// Calibration registers. Writing them can ruin the device accuracy.
pub const CALIBRATION: std::ops::RangeInclusive<u16> = 55..=62;

/// Persisted options.
pub const OPTIONS: std::ops::RangeInclusive<u16> = 66..=72;

/// Number of preset memories, M0 (active setting) to M9.
pub const PRESET_COUNT: u8 = 10;

/// Registers per preset: voltage, current, OVP, OCP.
pub const PRESET_LENGTH: u16 = 4;

/// Access mode of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::ReadOnly => f.write_str("r"),
            Access::ReadWrite => f.write_str("rw"),
        }
    }
}

/// A named register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Register {
    pub address: u16,
    pub name: &'static str,
    pub access: Access,
    pub description: &'static str,
}

const fn reg(
    address: u16,
    name: &'static str,
    access: Access,
    description: &'static str,
) -> Register {
    Register {
        address,
        name,
        access,
        description,
    }
}

use Access::{ReadOnly, ReadWrite};

/// All known registers, sorted by address.
#[rustfmt::skip]
pub static REGISTERS: &[Register] = &[
    reg(0, "ID", ReadOnly, "type ID"),
    reg(1, "SN_H", ReadOnly, "serial number H"),
    reg(2, "SN_L", ReadOnly, "serial number L"),
    reg(3, "FW", ReadOnly, "firmware version *100"),
    reg(4, "INT_C_S", ReadOnly, "internal sensor failure"),
    reg(5, "INT_C", ReadOnly, "internal temperature C"),
    reg(6, "INT_F_S", ReadOnly, "internal sensor failure"),
    reg(7, "INT_F", ReadOnly, "internal temperature F"),
    reg(8, "V_SET", ReadWrite, "set voltage"),
    reg(9, "I_SET", ReadWrite, "set current"),
    reg(10, "V_OUT", ReadOnly, "actual voltage"),
    reg(11, "I_OUT", ReadOnly, "actual current"),
    reg(12, "AH", ReadOnly, "amphour"),
    reg(13, "P_OUT", ReadOnly, "actual power"),
    reg(14, "V_IN", ReadOnly, "input voltage"),
    reg(15, "KEYPAD", ReadOnly, "keyboard locked"),
    reg(16, "OVP_OCP", ReadOnly, "OVP-OCP active"),
    reg(17, "CV_CC", ReadOnly, "output at constant current"),
    reg(18, "OUTPUT", ReadWrite, "output enabled"),
    reg(19, "PRESET", ReadWrite, "preset number"),
    reg(20, "I_RANGE", ReadOnly, "current range"),
    reg(32, "BAT_MODE", ReadOnly, "battery mode enabled"),
    reg(33, "V_BAT", ReadOnly, "battery voltage"),
    reg(34, "EXT_C_S", ReadOnly, "external sensor failure"),
    reg(35, "EXT_C", ReadOnly, "external sensor temperature C"),
    reg(36, "EXT_F_S", ReadOnly, "external sensor failure"),
    reg(37, "EXT_F", ReadOnly, "external sensor temperature F"),
    reg(38, "AH_H", ReadOnly, "amphour H"),
    reg(39, "AH_L", ReadOnly, "amphour L"),
    reg(40, "WH_H", ReadOnly, "watthour H"),
    reg(41, "WH_L", ReadOnly, "watthour L"),
    reg(48, "YEAR", ReadWrite, "clock year"),
    reg(49, "MONTH", ReadWrite, "clock month"),
    reg(50, "DAY", ReadWrite, "clock day"),
    reg(51, "HOUR", ReadWrite, "clock hour"),
    reg(52, "MINUTE", ReadWrite, "clock minute"),
    reg(53, "SECOND", ReadWrite, "clock second"),
    reg(55, "V_OUT_ZERO", ReadWrite, "calibration V_OUT_ZERO"),
    reg(56, "V_OUT_SCALE", ReadWrite, "calibration V_OUT_SCALE"),
    reg(57, "V_BACK_ZERO", ReadWrite, "calibration V_BACK_ZERO"),
    reg(58, "V_BACK_SCALE", ReadWrite, "calibration V_BACK_SCALE"),
    reg(59, "I_OUT_ZERO", ReadWrite, "calibration I_OUT_ZERO"),
    reg(60, "I_OUT_SCALE", ReadWrite, "calibration I_OUT_SCALE"),
    reg(61, "I_BACK_ZERO", ReadWrite, "calibration I_BACK_ZERO"),
    reg(62, "I_BACK_SCALE", ReadWrite, "calibration I_BACK_SCALE"),
    reg(66, "OPT_TAKE_OK", ReadWrite, "confirm memory select"),
    reg(67, "OPT_TAKE_OUT", ReadWrite, "output enabled on memory select"),
    reg(68, "OPT_BOOT_POW", ReadWrite, "output enabled on boot"),
    reg(69, "OPT_BUZZ", ReadWrite, "buzzer enabled"),
    reg(70, "OPT_LOGO", ReadWrite, "logo enabled on boot"),
    reg(71, "OPT_LANG", ReadWrite, "interface language"),
    reg(72, "OPT_LIGHT", ReadWrite, "display backlight level"),
    reg(80, "M0_V", ReadWrite, "currently set V"),
    reg(81, "M0_I", ReadWrite, "currently set I"),
    reg(82, "M0_OVP", ReadWrite, "currently set OVP"),
    reg(83, "M0_OCP", ReadWrite, "currently set OCP"),
    reg(84, "M1_V", ReadWrite, "memory M1 V"),
    reg(85, "M1_I", ReadWrite, "memory M1 I"),
    reg(86, "M1_OVP", ReadWrite, "memory M1 OVP"),
    reg(87, "M1_OCP", ReadWrite, "memory M1 OCP"),
    reg(88, "M2_V", ReadWrite, "memory M2 V"),
    reg(89, "M2_I", ReadWrite, "memory M2 I"),
    reg(90, "M2_OVP", ReadWrite, "memory M2 OVP"),
    reg(91, "M2_OCP", ReadWrite, "memory M2 OCP"),
    reg(92, "M3_V", ReadWrite, "memory M3 V"),
    reg(93, "M3_I", ReadWrite, "memory M3 I"),
    reg(94, "M3_OVP", ReadWrite, "memory M3 OVP"),
    reg(95, "M3_OCP", ReadWrite, "memory M3 OCP"),
    reg(96, "M4_V", ReadWrite, "memory M4 V"),
    reg(97, "M4_I", ReadWrite, "memory M4 I"),
    reg(98, "M4_OVP", ReadWrite, "memory M4 OVP"),
    reg(99, "M4_OCP", ReadWrite, "memory M4 OCP"),
    reg(100, "M5_V", ReadWrite, "memory M5 V"),
    reg(101, "M5_I", ReadWrite, "memory M5 I"),
    reg(102, "M5_OVP", ReadWrite, "memory M5 OVP"),
    reg(103, "M5_OCP", ReadWrite, "memory M5 OCP"),
    reg(104, "M6_V", ReadWrite, "memory M6 V"),
    reg(105, "M6_I", ReadWrite, "memory M6 I"),
    reg(106, "M6_OVP", ReadWrite, "memory M6 OVP"),
    reg(107, "M6_OCP", ReadWrite, "memory M6 OCP"),
    reg(108, "M7_V", ReadWrite, "memory M7 V"),
    reg(109, "M7_I", ReadWrite, "memory M7 I"),
    reg(110, "M7_OVP", ReadWrite, "memory M7 OVP"),
    reg(111, "M7_OCP", ReadWrite, "memory M7 OCP"),
    reg(112, "M8_V", ReadWrite, "memory M8 V"),
    reg(113, "M8_I", ReadWrite, "memory M8 I"),
    reg(114, "M8_OVP", ReadWrite, "memory M8 OVP"),
    reg(115, "M8_OCP", ReadWrite, "memory M8 OCP"),
    reg(116, "M9_V", ReadWrite, "memory M9 V"),
    reg(117, "M9_I", ReadWrite, "memory M9 I"),
    reg(118, "M9_OVP", ReadWrite, "memory M9 OVP"),
    reg(119, "M9_OCP", ReadWrite, "memory M9 OCP"),
];

/// Looks up a register by its address.
pub fn by_address(address: u16) -> Option<&'static Register> {
    REGISTERS
        .binary_search_by_key(&address, |r| r.address)
        .ok()
        .map(|index| &REGISTERS[index])
}

/// Looks up a register by its name, ignoring case.
pub fn by_name(name: &str) -> Option<&'static Register> {
    REGISTERS.iter().find(|r| r.name.eq_ignore_ascii_case(name))
}

/// `true` for the calibration registers.
pub fn is_calibration(address: u16) -> bool {
    CALIBRATION.contains(&address)
}

/// A register given either by name or by numeric address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterRef {
    Name(String),
    Address(u16),
}

impl RegisterRef {
    /// Resolves the reference to a numeric address.
    pub fn resolve(&self) -> Result<u16> {
        match self {
            RegisterRef::Address(address) => Ok(*address),
            RegisterRef::Name(name) => by_name(name)
                .map(|r| r.address)
                .ok_or_else(|| Error::UnknownRegister(name.clone())),
        }
    }
}

impl From<u16> for RegisterRef {
    fn from(address: u16) -> Self {
        RegisterRef::Address(address)
    }
}

impl From<&str> for RegisterRef {
    fn from(name: &str) -> Self {
        RegisterRef::Name(name.to_string())
    }
}

impl FromStr for RegisterRef {
    type Err = Error;

    /// Accepts a register name or a decimal address. Names are validated here
    /// so a typo is reported before any bus traffic.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(number) = s.parse::<i64>() {
            return Ok(RegisterRef::Address(crate::protocol::register_address(
                number,
            )?));
        }
        match by_name(s) {
            Some(register) => Ok(RegisterRef::Name(register.name.to_string())),
            None => Err(Error::UnknownRegister(s.to_string())),
        }
    }
}

impl fmt::Display for RegisterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterRef::Name(name) => f.write_str(name),
            RegisterRef::Address(address) => write!(f, "{address}"),
        }
    }
}

/// Raw register words of one preset memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Preset {
    pub voltage: u16,
    pub current: u16,
    pub over_voltage: u16,
    pub over_current: u16,
}

impl Preset {
    /// First register of preset memory `index`.
    pub fn address(index: u8) -> Result<u16> {
        if index >= PRESET_COUNT {
            return Err(Error::PresetOutOfRange(index));
        }
        Ok(addr::M0_V + PRESET_LENGTH * index as u16)
    }

    pub fn from_words(words: &[u16]) -> Self {
        Self {
            voltage: words[0],
            current: words[1],
            over_voltage: words[2],
            over_current: words[3],
        }
    }

    pub fn to_words(&self) -> [u16; 4] {
        [
            self.voltage,
            self.current,
            self.over_voltage,
            self.over_current,
        ]
    }
}
