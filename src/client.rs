//! High level access to an RD60xx power supply in physical units.
use crate::profile::Profile;
use crate::protocol::{to_register_value, u32_from_words};
use crate::registers::{addr, Preset, RegisterRef, PRESET_COUNT, PRESET_LENGTH};
use crate::store::{RegisterChange, RegisterStore, WriteMode};
use crate::transport::Transport;
use crate::{Error, Result};
use chrono::{Datelike, Local, NaiveDateTime, TimeDelta, Timelike};
use std::fmt;

/// Identity of the connected device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DeviceInfo {
    pub model: &'static str,
    pub id: u16,
    pub serial: u32,
    pub firmware: f64,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} typeID={} serno={} fwno={}",
            self.model, self.id, self.serial, self.firmware
        )
    }
}

/// Battery charging values, present in battery mode.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct BatteryState {
    #[cfg_attr(feature = "serde", serde(rename = "isbat"))]
    pub active: bool,
    #[cfg_attr(feature = "serde", serde(rename = "Vbat"))]
    pub voltage: f64,
    #[cfg_attr(feature = "serde", serde(rename = "Ah"))]
    pub amp_hours: f64,
    #[cfg_attr(feature = "serde", serde(rename = "Wh"))]
    pub watt_hours: f64,
}

/// Settings and measurements of the device in physical units.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct State {
    #[cfg_attr(feature = "serde", serde(rename = "Vset"))]
    pub voltage_set: f64,
    #[cfg_attr(feature = "serde", serde(rename = "Iset"))]
    pub current_set: f64,
    #[cfg_attr(feature = "serde", serde(rename = "out"))]
    pub output: bool,
    #[cfg_attr(feature = "serde", serde(rename = "Vout"))]
    pub voltage_out: f64,
    #[cfg_attr(feature = "serde", serde(rename = "Iout"))]
    pub current_out: f64,
    #[cfg_attr(feature = "serde", serde(rename = "Pout"))]
    pub power_out: f64,
    #[cfg_attr(feature = "serde", serde(rename = "Vin"))]
    pub voltage_in: f64,
    #[cfg_attr(feature = "serde", serde(rename = "cccv"))]
    pub constant_current: bool,
    #[cfg_attr(feature = "serde", serde(rename = "ovpocp"))]
    pub protection_tripped: bool,
    #[cfg_attr(feature = "serde", serde(rename = "OVP"))]
    pub over_voltage_protection: Option<f64>,
    #[cfg_attr(feature = "serde", serde(rename = "OCP"))]
    pub over_current_protection: Option<f64>,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub battery: Option<BatteryState>,
    #[cfg_attr(feature = "serde", serde(rename = "tempint"))]
    pub internal_temperature: u16,
    #[cfg_attr(
        feature = "serde",
        serde(rename = "tempext", skip_serializing_if = "Option::is_none")
    )]
    pub external_temperature: Option<u16>,
    #[cfg_attr(
        feature = "serde",
        serde(rename = "autorange", skip_serializing_if = "Option::is_none")
    )]
    pub high_range: Option<bool>,
}

/// Client for an RD60xx power supply.
///
/// Set-points are written through the write cache and reach the device on the
/// next [`Rd60xx::sync`], so several changes end up in a single frame.
///
/// # Examples
///
/// ```no_run
/// use rd60xx_lib::client::Rd60xx;
/// use rd60xx_lib::engine::Modbus;
/// use rd60xx_lib::store::RegisterStore;
/// use rd60xx_lib::transport::TcpTransport;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = TcpTransport::new("192.168.1.50", 8888);
/// let mut psu = Rd60xx::new(RegisterStore::new(Modbus::new(transport, 1)));
/// psu.set_voltage(5.0, false)?;
/// psu.set_current(0.5, false)?;
/// psu.set_output_enabled(true)?;
/// println!("{:?}", psu.state()?);
/// # Ok(())
/// # }
/// ```
pub struct Rd60xx<T: Transport> {
    store: RegisterStore<T>,
}

impl<T: Transport> Rd60xx<T> {
    pub fn new(store: RegisterStore<T>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RegisterStore<T> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut RegisterStore<T> {
        &mut self.store
    }

    /// Flushes pending writes and refreshes the state if needed.
    pub fn sync(&mut self, force: bool) -> Result<()> {
        self.store.sync(force)
    }

    /// The profile of the connected device. Triggers the initial read.
    pub fn profile(&mut self) -> Result<Profile> {
        self.store.initialize().cloned()
    }

    pub fn read_register(&mut self, register: impl Into<RegisterRef>, force: bool) -> Result<u16> {
        self.store.initialize()?;
        self.store.read_register(register, force)
    }

    pub fn write_register(
        &mut self,
        register: impl Into<RegisterRef>,
        value: u16,
        mode: WriteMode,
    ) -> Result<()> {
        self.store.initialize()?;
        self.store.write_register(register, value, mode)
    }

    pub fn read_registers(
        &mut self,
        register: impl Into<RegisterRef>,
        count: usize,
    ) -> Result<Vec<u16>> {
        self.store.initialize()?;
        self.store.read_registers(register, count)
    }

    pub fn write_registers(
        &mut self,
        register: impl Into<RegisterRef>,
        values: &[u16],
    ) -> Result<()> {
        self.store.initialize()?;
        self.store.write_registers(register, values)
    }

    /// Caches a new value for `address`, given in physical units with `scale`
    /// raw steps per unit. A relative value is added to the current one.
    fn set_scaled(&mut self, address: u16, value: f64, scale: u16, relative: bool) -> Result<()> {
        let scale = scale as f64;
        let target = if relative {
            self.store.read_register(address, false)? as f64 / scale + value
        } else {
            value
        };
        let raw = to_register_value((target * scale).round())?;
        self.store.write_register(address, raw, WriteMode::Cached)
    }

    /// Sets the output voltage in volts.
    pub fn set_voltage(&mut self, volts: f64, relative: bool) -> Result<()> {
        let scale = self.profile()?.voltage_scale();
        self.set_scaled(addr::V_SET, volts, scale, relative)
    }

    /// Sets the output current limit in amps.
    pub fn set_current(&mut self, amps: f64, relative: bool) -> Result<()> {
        let scale = self.profile()?.current_scale();
        self.set_scaled(addr::I_SET, amps, scale, relative)
    }

    /// Sets the over-voltage protection of the active setting in volts.
    pub fn set_over_voltage_protection(&mut self, volts: f64, relative: bool) -> Result<()> {
        let scale = self.profile()?.voltage_scale();
        self.set_scaled(addr::M0_OVP, volts, scale, relative)
    }

    /// Sets the over-current protection of the active setting in amps.
    pub fn set_over_current_protection(&mut self, amps: f64, relative: bool) -> Result<()> {
        let scale = self.profile()?.current_scale();
        self.set_scaled(addr::M0_OCP, amps, scale, relative)
    }

    /// Switches the output and synchronizes.
    pub fn set_output_enabled(&mut self, enabled: bool) -> Result<()> {
        self.store.initialize()?;
        self.store
            .write_register(addr::OUTPUT, enabled as u16, WriteMode::Cached)?;
        self.store.sync(false)
    }

    /// Inverts the output state and returns the new one.
    pub fn toggle_output(&mut self) -> Result<bool> {
        self.store.sync(false)?;
        let enabled = self.store.read_register(addr::OUTPUT, false)? == 0;
        self.set_output_enabled(enabled)?;
        Ok(enabled)
    }

    /// Reads the raw values of preset memory `index`.
    pub fn read_preset(&mut self, index: u8) -> Result<Preset> {
        let address = Preset::address(index)?;
        let words = self.read_registers(address, PRESET_LENGTH as usize)?;
        Ok(Preset::from_words(&words))
    }

    /// Reads all preset memories in one exchange.
    pub fn read_presets(&mut self) -> Result<Vec<Preset>> {
        let words = self.read_registers(
            addr::M0_V,
            PRESET_COUNT as usize * PRESET_LENGTH as usize,
        )?;
        Ok(words
            .chunks_exact(PRESET_LENGTH as usize)
            .map(Preset::from_words)
            .collect())
    }

    /// Writes preset memory `index` and returns what the device stored.
    pub fn write_preset(&mut self, index: u8, preset: Preset) -> Result<Preset> {
        let address = Preset::address(index)?;
        self.write_registers(address, &preset.to_words())?;
        let stored = self.read_preset(index)?;
        if stored != preset {
            log::warn!("Preset M{index} read back as {stored:?}, written {preset:?}");
        }
        Ok(stored)
    }

    /// Writes preset memory `index` from volts and amps:
    /// `[voltage, current, over-voltage, over-current]`.
    pub fn write_preset_values(&mut self, index: u8, values: [f64; 4]) -> Result<Preset> {
        Preset::address(index)?;
        let profile = self.profile()?;
        let volts = profile.voltage_scale() as f64;
        let amps = profile.current_scale() as f64;
        let preset = Preset {
            voltage: to_register_value((values[0] * volts).round())?,
            current: to_register_value((values[1] * amps).round())?,
            over_voltage: to_register_value((values[2] * volts).round())?,
            over_current: to_register_value((values[3] * amps).round())?,
        };
        self.write_preset(index, preset)
    }

    /// Sets the device clock.
    pub fn set_clock(&mut self, time: NaiveDateTime) -> Result<()> {
        let year = u16::try_from(time.year())
            .map_err(|_| Error::ValueOutOfRange(time.year() as f64))?;
        let words = [
            year,
            time.month() as u16,
            time.day() as u16,
            time.hour() as u16,
            time.minute() as u16,
            time.second() as u16,
        ];
        log::debug!("Setting clock to {time}");
        self.write_registers(addr::YEAR, &words)
    }

    /// Sets the device clock to the local time, one second ahead to make up
    /// for the transfer.
    pub fn sync_clock(&mut self) -> Result<NaiveDateTime> {
        let time = (Local::now() + TimeDelta::seconds(1)).naive_local();
        self.set_clock(time)?;
        Ok(time)
    }

    pub fn device_info(&mut self) -> Result<DeviceInfo> {
        let profile = self.profile()?;
        Ok(DeviceInfo {
            model: profile.name(),
            id: profile.id(),
            serial: self.store.get_u32(addr::SN_H)?,
            firmware: self.store.read_register(addr::FW, false)? as f64 / 100.0,
        })
    }

    /// Reads the state block and converts it to physical units.
    pub fn state(&mut self) -> Result<State> {
        self.store.sync(true)?;
        let profile = self.profile()?;
        let volts = profile.voltage_scale() as f64;
        let amps = profile.current_scale() as f64;
        let watts = profile.power_scale() as f64;
        let battery_mode = self.store.is_battery_mode();
        let protection = self.store.protection();
        let mut get = |address: u16| self.store.read_register(address, false);

        let battery = if battery_mode {
            Some(BatteryState {
                active: get(addr::BAT_MODE)? > 0,
                voltage: get(addr::V_BAT)? as f64 / volts,
                amp_hours: u32_from_words(get(addr::AH_H)?, get(addr::AH_H + 1)?) as f64 / 1000.0,
                watt_hours: u32_from_words(get(addr::WH_H)?, get(addr::WH_H + 1)?) as f64 / 1000.0,
            })
        } else {
            None
        };
        let external_temperature = if battery_mode && get(addr::EXT_C_S)? == 0 {
            Some(get(addr::EXT_C)?)
        } else {
            None
        };

        Ok(State {
            voltage_set: get(addr::V_SET)? as f64 / volts,
            current_set: get(addr::I_SET)? as f64 / amps,
            output: get(addr::OUTPUT)? > 0,
            voltage_out: get(addr::V_OUT)? as f64 / volts,
            current_out: get(addr::I_OUT)? as f64 / amps,
            power_out: get(addr::P_OUT)? as f64 / watts,
            voltage_in: get(addr::V_IN)? as f64 / volts,
            constant_current: get(addr::CV_CC)? > 0,
            protection_tripped: get(addr::OVP_OCP)? > 0,
            over_voltage_protection: protection.map(|p| p.over_voltage as f64 / volts),
            over_current_protection: protection.map(|p| p.over_current as f64 / amps),
            battery,
            internal_temperature: get(addr::INT_C)?,
            external_temperature,
            high_range: profile
                .is_dual_range()
                .then_some(profile.is_high_range()),
        })
    }

    /// Registers changed since the last snapshot.
    pub fn changes(&mut self) -> Result<Vec<RegisterChange>> {
        self.store.changes()
    }

    pub fn save_snapshot(&mut self) {
        self.store.save_snapshot();
    }

    /// Drops pending writes without sending them, e.g. when a later part of
    /// the same change was rejected.
    pub fn discard_pending_writes(&mut self) -> usize {
        self.store.discard_pending_writes()
    }

    /// Flushes pending writes and closes the connection.
    pub fn close(&mut self) {
        self.store.close();
    }
}
