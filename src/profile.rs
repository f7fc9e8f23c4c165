//! Device model detection and scaling constants.
//!
//! Raw register values are integers; the model decides by which factor a
//! voltage or current register must be divided to obtain volts or amps.
//! Detection runs once per connection from the identity register. Models with
//! two current ranges are refined afterwards from the range selector register
//! without repeating the detection.
use crate::{Error, Result};
use std::fmt;

/// Power registers use a fixed factor on every model.
pub const POWER_SCALE: u16 = 100;

/// Scale factors used when the model is not known.
pub const DEFAULT_SCALE: u16 = 100;

/// Identity codes of the RD60xx product family.
pub const FAMILY_IDS: std::ops::RangeInclusive<u16> = 60000..=60999;

/// Limits and scale factors of one current range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub max_current: u16,
    pub max_power: u16,
    pub current_scale: u16,
}

/// Static description of a device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub name: &'static str,
    pub max_voltage: u16,
    pub voltage_scale: u16,
    pub range: Range,
    /// Alternative range selected while the range register is non-zero.
    pub high_range: Option<Range>,
}

const fn model(
    name: &'static str,
    max_current: u16,
    max_voltage: u16,
    max_power: u16,
    current_scale: u16,
    voltage_scale: u16,
) -> Model {
    Model {
        name,
        max_voltage,
        voltage_scale,
        range: Range {
            max_current,
            max_power,
            current_scale,
        },
        high_range: None,
    }
}

pub const RD6006: Model = model("RD6006", 6, 60, 360, 1000, 100);
pub const RK6006: Model = model("RK6006", 6, 60, 360, 1000, 100);
pub const RD6006P: Model = model("RD6006P", 6, 60, 360, 10000, 1000);
pub const RD6012: Model = model("RD6012", 12, 60, 720, 100, 100);
pub const RD6012P: Model = Model {
    high_range: Some(Range {
        max_current: 12,
        max_power: 720,
        current_scale: 1000,
    }),
    ..model("RD6012P", 6, 60, 360, 10000, 1000)
};
pub const RD6018: Model = model("RD6018", 18, 60, 1080, 100, 100);
pub const RD6024: Model = model("RD6024", 24, 60, 1440, 100, 100);

/// Identity register values of supported models.
static SUPPORTED: &[(u16, &Model)] = &[
    (60061, &RD6006),
    (60062, &RD6006),
    (60065, &RD6006P),
    (60066, &RK6006),
    (60121, &RD6012),
    (60125, &RD6012P),
    (60181, &RD6018),
    (60241, &RD6024),
];

/// Identity register values of the DP series, whose register layout is
/// incompatible.
static UNSUPPORTED: &[(u16, &str)] = &[
    (3005, "DPS3005"),
    (5005, "DPS5005"),
    (5205, "DPH5005"),
    (5015, "DPS5015"),
    (5020, "DPS5020"),
    (8005, "DPS8005"),
];

/// Looks up a supported model by identity code.
pub fn lookup(id: u16) -> Option<&'static Model> {
    SUPPORTED
        .iter()
        .find(|(code, _)| *code == id)
        .map(|(_, model)| *model)
}

/// The profile selected for the connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    id: u16,
    model: Option<&'static Model>,
    high_range: bool,
}

impl Profile {
    /// Selects the profile for identity register value `id`.
    ///
    /// Unknown codes inside the RD60xx family fall back to the default scale
    /// factors with a warning; everything else is refused before any further
    /// register is touched.
    pub fn detect(id: u16) -> Result<Self> {
        if let Some(model) = lookup(id) {
            log::info!("Detected {} (type ID {id})", model.name);
            if model.high_range.is_some() {
                log::warn!(
                    "{} has two current ranges with different resolution, \
                     current range follows register I_RANGE",
                    model.name
                );
            }
            return Ok(Self {
                id,
                model: Some(model),
                high_range: false,
            });
        }
        if let Some((_, name)) = UNSUPPORTED.iter().find(|(code, _)| *code == id) {
            return Err(Error::UnsupportedModel { id, name: *name });
        }
        if FAMILY_IDS.contains(&id) {
            log::warn!(
                "Unknown device type ID {id}, voltage and current values may be \
                 an order of magnitude off (assuming scale {DEFAULT_SCALE})"
            );
            return Ok(Self {
                id,
                model: None,
                high_range: false,
            });
        }
        Err(Error::UnknownModel(id))
    }

    /// Re-selects the current range from the range selector register.
    /// Models with a single range ignore it.
    pub fn refine(&mut self, range_register: u16) {
        let high = range_register > 0 && self.model.is_some_and(|m| m.high_range.is_some());
        if high != self.high_range {
            log::debug!(
                "Current range switched to {}",
                if high { "high" } else { "low" }
            );
        }
        self.high_range = high;
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn model(&self) -> Option<&'static Model> {
        self.model
    }

    pub fn name(&self) -> &'static str {
        self.model.map_or("[unknown]", |m| m.name)
    }

    /// `true` if the device supports two current ranges.
    pub fn is_dual_range(&self) -> bool {
        self.model.is_some_and(|m| m.high_range.is_some())
    }

    /// `true` while the secondary current range is selected.
    pub fn is_high_range(&self) -> bool {
        self.high_range
    }

    fn range(&self) -> Option<Range> {
        let model = self.model?;
        Some(match (self.high_range, model.high_range) {
            (true, Some(high)) => high,
            _ => model.range,
        })
    }

    pub fn voltage_scale(&self) -> u16 {
        self.model.map_or(DEFAULT_SCALE, |m| m.voltage_scale)
    }

    pub fn current_scale(&self) -> u16 {
        self.range().map_or(DEFAULT_SCALE, |r| r.current_scale)
    }

    pub fn power_scale(&self) -> u16 {
        POWER_SCALE
    }

    pub fn max_voltage(&self) -> Option<u16> {
        self.model.map(|m| m.max_voltage)
    }

    pub fn max_current(&self) -> Option<u16> {
        self.range().map(|r| r.max_current)
    }

    pub fn max_power(&self) -> Option<u16> {
        self.range().map(|r| r.max_power)
    }

    /// Decimal places matching the voltage resolution.
    pub fn voltage_decimals(&self) -> usize {
        decimals(self.voltage_scale())
    }

    /// Decimal places matching the current resolution.
    pub fn current_decimals(&self) -> usize {
        decimals(self.current_scale())
    }

    /// Field width for right-aligned display of voltages and currents.
    pub fn field_width(&self) -> usize {
        if self.voltage_scale() > 100 || self.current_scale() > 100 {
            7
        } else {
            6
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (type ID {})", self.name(), self.id)?;
        if let (Some(v), Some(i), Some(p)) =
            (self.max_voltage(), self.max_current(), self.max_power())
        {
            write!(f, " {v} V / {i} A / {p} W")?;
        }
        write!(
            f,
            ", scale V={} I={}",
            self.voltage_scale(),
            self.current_scale()
        )
    }
}

fn decimals(scale: u16) -> usize {
    match scale {
        1 => 0,
        10 => 1,
        100 => 2,
        1000 => 3,
        10000 => 4,
        _ => 3,
    }
}
