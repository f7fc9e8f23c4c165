//! Local view of the device register space.
//!
//! The [`RegisterStore`] keeps a mirror of every register it has read, a copy
//! of that mirror taken at a chosen moment (for change detection) and a cache
//! of pending writes. Writes are usually cached and coalesced into as few
//! frames as possible when the store is synchronized. Reads of the state block
//! are skipped while the mirror is younger than the staleness threshold.
use crate::engine::Modbus;
use crate::profile::Profile;
use crate::protocol::{u32_from_words, MAX_READ_COUNT, MAX_WRITE_COUNT};
use crate::registers::{
    addr, RegisterRef, CLOCK, OPTIONS, REDUCED_STATE_END, STATE_BLOCK_LENGTH,
    STATE_RESYNC_START,
};
use crate::transport::Transport;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Default age after which the state block is read again.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(1);

/// Cached writes at or above this address belong to the preset group, which
/// is flushed before everything below it.
pub const PRESET_GROUP_START: u16 = addr::M0_V;

/// Address ranges whose cached writes are coalesced into one frame each, in
/// flush order. Cached addresses outside of them (calibration included) are
/// written one by one, so a frame never covers a register outside its group.
const FLUSH_GROUPS: [RangeInclusive<u16>; 4] = [
    PRESET_GROUP_START..=u16::MAX,
    addr::ID..=STATE_BLOCK_LENGTH,
    CLOCK,
    OPTIONS,
];

/// Registers that change all the time and are left out of change reports.
pub const NOISY_REGISTERS: [u16; 4] = [addr::V_IN, addr::EXT_C, addr::EXT_F, addr::KEYPAD];

/// How a register is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Written to the device right away.
    Immediate,
    /// Held in the write cache until the next flush.
    Cached,
}

/// Source of the values for uncached addresses inside a coalesced write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum GapFill {
    /// Read the span from the device right before the batched write.
    #[default]
    Device,
    /// Use the mirror; never read addresses are written as zero.
    Mirror,
}

/// Raw OVP and OCP of the active setting (preset M0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protection {
    pub over_voltage: u16,
    pub over_current: u16,
}

/// A register whose value differs from the saved snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterChange {
    pub address: u16,
    pub previous: Option<u16>,
    pub current: Option<u16>,
}

/// Register mirror, snapshot and write cache of one device session.
pub struct RegisterStore<T: Transport> {
    modbus: Modbus<T>,
    mirror: Vec<Option<u16>>,
    previous: Vec<Option<u16>>,
    cache: BTreeMap<u16, u16>,
    last_sync: Option<Instant>,
    profile: Option<Profile>,
    protection: Option<Protection>,
    battery_override: Option<bool>,
    battery: bool,
    refresh: bool,
    written: bool,
    staleness: Duration,
    gap_fill: GapFill,
}

impl<T: Transport> RegisterStore<T> {
    pub fn new(modbus: Modbus<T>) -> Self {
        Self {
            modbus,
            mirror: Vec::new(),
            previous: Vec::new(),
            cache: BTreeMap::new(),
            last_sync: None,
            profile: None,
            protection: None,
            battery_override: None,
            battery: false,
            refresh: false,
            written: false,
            staleness: DEFAULT_STALENESS,
            gap_fill: GapFill::default(),
        }
    }

    pub fn with_staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn with_gap_fill(mut self, gap_fill: GapFill) -> Self {
        self.gap_fill = gap_fill;
        self
    }

    /// Forces battery mode on or off instead of detecting it.
    pub fn with_battery_mode(mut self, battery: Option<bool>) -> Self {
        self.battery_override = battery;
        if let Some(battery) = battery {
            self.battery = battery;
        }
        self
    }

    pub fn modbus(&self) -> &Modbus<T> {
        &self.modbus
    }

    pub fn modbus_mut(&mut self) -> &mut Modbus<T> {
        &mut self.modbus
    }

    /// The detected profile, available after the first synchronization.
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    pub fn protection(&self) -> Option<Protection> {
        self.protection
    }

    pub fn is_battery_mode(&self) -> bool {
        self.battery
    }

    /// Raw mirror contents, `None` for addresses never read.
    pub fn mirror(&self) -> &[Option<u16>] {
        &self.mirror
    }

    /// Value of `address` in the mirror, if known.
    pub fn value(&self, address: u16) -> Option<u16> {
        self.mirror.get(address as usize).copied().flatten()
    }

    /// Pending writes, ordered by address.
    pub fn pending_writes(&self) -> &BTreeMap<u16, u16> {
        &self.cache
    }

    /// Performs the first full read if it did not happen yet and returns the
    /// detected profile.
    pub fn initialize(&mut self) -> Result<&Profile> {
        let profile = match self.profile.take() {
            Some(profile) => profile,
            None => self.initial_read()?,
        };
        Ok(self.profile.insert(profile))
    }

    fn initial_read(&mut self) -> Result<Profile> {
        log::debug!("Initial register read");
        let words = self.modbus.read_words(addr::ID, STATE_BLOCK_LENGTH)?;
        let mut profile = Profile::detect(words[addr::ID as usize])?;
        profile.refine(words[addr::I_RANGE as usize]);
        if self.battery_override.is_none() {
            self.battery = words[addr::BAT_MODE as usize] > 0;
            if self.battery {
                log::info!("Battery mode detected");
            }
        }
        self.store_words(addr::ID, &words);
        self.last_sync = Some(Instant::now());
        self.written = false;
        self.refresh = false;

        let protection = self.modbus.read_words(addr::M0_OVP, 2)?;
        self.store_words(addr::M0_OVP, &protection);
        self.save_snapshot();
        Ok(profile)
    }

    /// Brings the mirror and the device in line: performs the initial read if
    /// needed, flushes pending writes and re-reads the state block when a
    /// write happened, a refresh was requested, `force` is set or the mirror
    /// is older than the staleness threshold.
    pub fn sync(&mut self, force: bool) -> Result<()> {
        self.initialize()?;
        self.flush_write_cache()?;
        let stale = self
            .last_sync
            .map_or(true, |last| last.elapsed() >= self.staleness);
        if force || self.written || self.refresh || stale {
            self.read_state()?;
        }
        Ok(())
    }

    /// Re-reads the changing part of the state block.
    fn read_state(&mut self) -> Result<()> {
        let end = if self.battery {
            STATE_BLOCK_LENGTH
        } else {
            REDUCED_STATE_END
        };
        self.read_into_mirror(STATE_RESYNC_START, end - STATE_RESYNC_START)?;
        self.last_sync = Some(Instant::now());
        self.written = false;
        self.refresh = false;
        Ok(())
    }

    /// Makes the next synchronization read the state block.
    pub fn request_refresh(&mut self) {
        self.refresh = true;
    }

    /// Writes `value` into a register, either right away or through the
    /// write cache.
    ///
    /// A cached write of the value the mirror already holds is dropped.
    pub fn write_register(
        &mut self,
        register: impl Into<RegisterRef>,
        value: u16,
        mode: WriteMode,
    ) -> Result<()> {
        let address = register.into().resolve()?;
        match mode {
            WriteMode::Immediate => {
                self.cache.remove(&address);
                self.modbus.write_word(address, value)?;
                self.set_value(address, value);
                self.written = true;
            }
            WriteMode::Cached => {
                if self.value(address) == Some(value) {
                    log::debug!("Cached write {address} = {value} skipped, value identical");
                    self.cache.remove(&address);
                } else {
                    log::debug!("Cached write {address} = {value}");
                    self.cache.insert(address, value);
                }
            }
        }
        Ok(())
    }

    /// Writes all cached values. The preset group goes first, then the state
    /// block, the clock and the options, each as a single frame. Anything
    /// else is written register by register.
    pub fn flush_write_cache(&mut self) -> Result<()> {
        if self.cache.is_empty() {
            return Ok(());
        }
        let mut rest = std::mem::take(&mut self.cache);
        for range in FLUSH_GROUPS {
            let (group, others): (BTreeMap<u16, u16>, BTreeMap<u16, u16>) = rest
                .into_iter()
                .partition(|(address, _)| range.contains(address));
            rest = others;
            self.flush_group(&group)?;
        }
        for (address, value) in rest {
            self.modbus.write_word(address, value)?;
            self.set_value(address, value);
        }
        self.written = true;
        Ok(())
    }

    /// Drops every pending write without touching the device. Returns the
    /// number of dropped writes.
    pub fn discard_pending_writes(&mut self) -> usize {
        let discarded = self.cache.len();
        if discarded > 0 {
            log::info!("Discarding {discarded} pending writes");
            self.cache.clear();
        }
        discarded
    }

    fn flush_group(&mut self, group: &BTreeMap<u16, u16>) -> Result<()> {
        let (Some((&start, _)), Some((&end, _))) = (group.first_key_value(), group.last_key_value())
        else {
            return Ok(());
        };
        if group.len() == 1 {
            self.modbus.write_word(start, group[&start])?;
            self.set_value(start, group[&start]);
            return Ok(());
        }

        let span = (end - start + 1) as usize;
        if span > MAX_WRITE_COUNT {
            for (&address, &value) in group {
                self.modbus.write_word(address, value)?;
                self.set_value(address, value);
            }
            return Ok(());
        }

        if self.gap_fill == GapFill::Device && span > group.len() {
            self.read_into_mirror(start, span as u16)?;
        }
        let mut values = Vec::with_capacity(span);
        for address in start..=end {
            let value = match group.get(&address) {
                Some(&value) => value,
                None => self.value(address).unwrap_or_else(|| {
                    log::warn!("Register {address} never read, writing 0");
                    0
                }),
            };
            values.push(value);
        }
        self.modbus.write_words(start, &values)?;
        self.store_words(start, &values);
        Ok(())
    }

    /// Returns a register value, from the mirror unless `force` is set or the
    /// value was never read.
    pub fn read_register(&mut self, register: impl Into<RegisterRef>, force: bool) -> Result<u16> {
        let address = register.into().resolve()?;
        match self.value(address) {
            Some(value) if !force => Ok(value),
            _ => {
                let words = self.read_into_mirror(address, 1)?;
                Ok(words[0])
            }
        }
    }

    /// Reads `count` registers from the device, in as many frames as needed.
    pub fn read_registers(
        &mut self,
        register: impl Into<RegisterRef>,
        count: usize,
    ) -> Result<Vec<u16>> {
        let start = register.into().resolve()?;
        if count == 0 || start as usize + count > 0x10000 {
            return Err(Error::InvalidCount(count));
        }
        let mut words = Vec::with_capacity(count);
        let mut address = start;
        while words.len() < count {
            let chunk = (count - words.len()).min(MAX_READ_COUNT) as u16;
            words.extend(self.read_into_mirror(address, chunk)?);
            address = address.wrapping_add(chunk);
        }
        Ok(words)
    }

    /// Writes consecutive registers to the device right away.
    pub fn write_registers(
        &mut self,
        register: impl Into<RegisterRef>,
        values: &[u16],
    ) -> Result<()> {
        let start = register.into().resolve()?;
        if values.is_empty() || start as usize + values.len() > 0x10000 {
            return Err(Error::InvalidCount(values.len()));
        }
        for (index, chunk) in values.chunks(MAX_WRITE_COUNT).enumerate() {
            let address = start + (index * MAX_WRITE_COUNT) as u16;
            for offset in 0..chunk.len() as u16 {
                self.cache.remove(&(address + offset));
            }
            self.modbus.write_words(address, chunk)?;
            self.store_words(address, chunk);
        }
        self.written = true;
        Ok(())
    }

    /// Assembles a 32-bit value from `high` and the register after it.
    pub fn get_u32(&mut self, high: impl Into<RegisterRef>) -> Result<u32> {
        let address = high.into().resolve()?;
        let words = match (self.value(address), self.value(address.wrapping_add(1))) {
            (Some(high), Some(low)) => [high, low],
            _ => {
                let words = self.read_registers(address, 2)?;
                [words[0], words[1]]
            }
        };
        Ok(u32_from_words(words[0], words[1]))
    }

    /// Copies the mirror into the snapshot used by [`RegisterStore::changes`].
    pub fn save_snapshot(&mut self) {
        self.previous = self.mirror.clone();
    }

    /// Lists registers that differ from the snapshot, after flushing pending
    /// writes and re-reading the state if anything was written.
    pub fn changes(&mut self) -> Result<Vec<RegisterChange>> {
        self.initialize()?;
        self.flush_write_cache()?;
        if self.written {
            self.read_state()?;
        }
        let length = self.mirror.len().max(self.previous.len());
        Ok((0..length)
            .filter_map(|index| {
                let address = index as u16;
                let previous = self.previous.get(index).copied().flatten();
                let current = self.value(address);
                (previous != current && !NOISY_REGISTERS.contains(&address)).then_some(
                    RegisterChange {
                        address,
                        previous,
                        current,
                    },
                )
            })
            .collect())
    }

    /// Flushes pending writes (best effort) and closes the transport.
    pub fn close(&mut self) {
        if !self.cache.is_empty() && !self.modbus.has_failed() {
            if let Err(error) = self.flush_write_cache() {
                log::warn!("Pending writes lost on close: {error}");
            }
        }
        self.modbus.close();
    }

    fn read_into_mirror(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        let words = self.modbus.read_words(start, count)?;
        self.store_words(start, &words);
        Ok(words)
    }

    fn store_words(&mut self, start: u16, words: &[u16]) {
        for (offset, &word) in words.iter().enumerate() {
            self.set_value(start + offset as u16, word);
        }
    }

    fn set_value(&mut self, address: u16, value: u16) {
        let index = address as usize;
        if self.mirror.len() <= index {
            self.mirror.resize(index + 1, None);
        }
        self.mirror[index] = Some(value);

        match address {
            addr::I_RANGE => {
                if let Some(profile) = self.profile.as_mut() {
                    profile.refine(value);
                }
            }
            addr::M0_OVP | addr::M0_OCP => {
                let protection = self.protection.get_or_insert(Protection {
                    over_voltage: 0,
                    over_current: 0,
                });
                if address == addr::M0_OVP {
                    protection.over_voltage = value;
                } else {
                    protection.over_current = value;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Fault, MockDevice};
    use crate::protocol::ExceptionCode;
    use assert_matches::assert_matches;

    fn store(device: MockDevice) -> RegisterStore<MockDevice> {
        let modbus = Modbus::new(device, 1)
            .with_retries(3)
            .with_write_delay(Duration::ZERO);
        RegisterStore::new(modbus).with_staleness(Duration::from_secs(3600))
    }

    fn synced(device: MockDevice) -> RegisterStore<MockDevice> {
        let mut store = store(device);
        store.sync(false).unwrap();
        store.modbus_mut().transport_mut().clear_transactions();
        store
    }

    fn device(store: &RegisterStore<MockDevice>) -> &MockDevice {
        store.modbus().transport()
    }

    #[test]
    fn initial_sync_detects_model() {
        let mut store = store(MockDevice::rd6006());
        store.sync(false).unwrap();
        let profile = store.profile().unwrap();
        assert_eq!(profile.name(), "RD6006");
        assert_eq!(profile.current_scale(), 1000);
        assert_eq!(store.value(addr::V_SET), Some(500));
        assert_eq!(
            store.protection(),
            Some(Protection {
                over_voltage: 6200,
                over_current: 6100
            })
        );
        assert!(!store.is_battery_mode());

        let reads = device(&store).reads();
        assert_eq!(reads.len(), 2);
        assert_eq!((reads[0].start, reads[0].count), (0, 42));
        assert_eq!((reads[1].start, reads[1].count), (82, 2));
    }

    #[test]
    fn unread_addresses_are_unknown() {
        let store = synced(MockDevice::rd6006());
        assert_eq!(store.value(41), Some(0));
        assert_eq!(store.value(50), None);
        assert_eq!(store.value(82), Some(6200));
        assert_eq!(store.value(500), None);
    }

    #[test]
    fn coalesced_preset_write() {
        let mut store = synced(MockDevice::rd6006()).with_gap_fill(GapFill::Mirror);
        store.read_registers(addr::M0_V, 4).unwrap();
        store.modbus_mut().transport_mut().clear_transactions();
        store.write_register(addr::M0_V, 600, WriteMode::Cached).unwrap();
        store.write_register(addr::M0_OVP, 6300, WriteMode::Cached).unwrap();
        store.flush_write_cache().unwrap();

        let transactions = device(&store).transactions().to_vec();
        assert_eq!(transactions.len(), 1);
        assert!(transactions[0].is_multi_write());
        assert_eq!((transactions[0].start, transactions[0].count), (80, 3));
        assert_eq!(device(&store).registers(80, 3), vec![600, 1000, 6300]);
        assert!(store.pending_writes().is_empty());
    }

    #[test]
    fn device_gap_fill_reads_span_first() {
        let mut store = synced(MockDevice::rd6006());
        // Changed on the front panel, unknown to the mirror.
        store
            .modbus_mut()
            .transport_mut()
            .set_registers(81, &[1500]);
        store.write_register(80, 600, WriteMode::Cached).unwrap();
        store.write_register(82, 6300, WriteMode::Cached).unwrap();
        store.flush_write_cache().unwrap();

        let transactions = device(&store).transactions().to_vec();
        assert_eq!(transactions.len(), 2);
        assert!(transactions[0].is_read());
        assert_eq!((transactions[0].start, transactions[0].count), (80, 3));
        assert!(transactions[1].is_multi_write());
        assert_eq!(device(&store).registers(80, 3), vec![600, 1500, 6300]);
        assert_eq!(store.value(81), Some(1500));
    }

    #[test]
    fn mirror_gap_fill_writes_stale_values_back() {
        let mut store = synced(MockDevice::rd6006()).with_gap_fill(GapFill::Mirror);
        store.read_registers(addr::M0_V, 4).unwrap();
        store
            .modbus_mut()
            .transport_mut()
            .set_registers(81, &[1500]);
        store.write_register(80, 600, WriteMode::Cached).unwrap();
        store.write_register(82, 6300, WriteMode::Cached).unwrap();
        store.flush_write_cache().unwrap();
        assert_eq!(device(&store).register(81), 1000);
    }

    #[test]
    fn contiguous_span_needs_no_gap_read() {
        let mut store = synced(MockDevice::rd6006());
        store.write_register("V_SET", 600, WriteMode::Cached).unwrap();
        store.write_register("I_SET", 2000, WriteMode::Cached).unwrap();
        store.flush_write_cache().unwrap();
        let transactions = device(&store).transactions().to_vec();
        assert_eq!(transactions.len(), 1);
        assert_eq!((transactions[0].start, transactions[0].count), (8, 2));
    }

    #[test]
    fn single_cached_write_uses_single_register_function() {
        let mut store = synced(MockDevice::rd6006());
        store.write_register("V_SET", 1200, WriteMode::Cached).unwrap();
        store.flush_write_cache().unwrap();
        let transactions = device(&store).transactions().to_vec();
        assert_eq!(transactions.len(), 1);
        assert!(transactions[0].is_single_write());
        assert_eq!(device(&store).register(addr::V_SET), 1200);
        assert_eq!(store.value(addr::V_SET), Some(1200));
    }

    #[test]
    fn identical_value_is_not_cached() {
        let mut store = synced(MockDevice::rd6006());
        store.write_register(addr::V_SET, 500, WriteMode::Cached).unwrap();
        assert!(store.pending_writes().is_empty());
        store.flush_write_cache().unwrap();
        assert!(device(&store).transactions().is_empty());
    }

    #[test]
    fn latest_cached_value_wins() {
        let mut store = synced(MockDevice::rd6006());
        store.write_register(addr::V_SET, 700, WriteMode::Cached).unwrap();
        store.write_register(addr::V_SET, 800, WriteMode::Cached).unwrap();
        assert_eq!(store.pending_writes().len(), 1);
        store.flush_write_cache().unwrap();
        assert_eq!(device(&store).register(addr::V_SET), 800);
    }

    #[test]
    fn preset_group_flushed_before_state_group() {
        let mut store = synced(MockDevice::rd6006());
        store.write_register(addr::OUTPUT, 0, WriteMode::Cached).unwrap();
        store.write_register(addr::M0_OCP, 5000, WriteMode::Cached).unwrap();
        store.write_register(addr::V_SET, 700, WriteMode::Cached).unwrap();
        store.flush_write_cache().unwrap();

        let writes = device(&store).writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].start, addr::M0_OCP);
        assert!(writes[0].is_single_write());
        assert_eq!(writes[1].start, addr::V_SET);
        assert_eq!(writes[1].count, addr::OUTPUT - addr::V_SET + 1);
        assert_eq!(device(&store).register(addr::OUTPUT), 0);
        assert_eq!(store.protection().unwrap().over_current, 5000);
    }

    #[test]
    fn state_and_option_writes_stay_apart() {
        for gap_fill in [GapFill::Device, GapFill::Mirror] {
            let mut psu = MockDevice::rd6006();
            psu.set_registers(55, &[11, 22, 33, 44, 55, 66, 77, 88]);
            psu.set_registers(addr::YEAR, &[2024, 5, 6, 7, 8, 9]);
            let mut store = synced(psu).with_gap_fill(gap_fill);
            store.write_register(addr::OUTPUT, 0, WriteMode::Cached).unwrap();
            store.write_register(70, 1, WriteMode::Cached).unwrap();
            store.write_register(72, 3, WriteMode::Cached).unwrap();
            store.flush_write_cache().unwrap();

            let transactions = device(&store).transactions().to_vec();
            assert!(
                transactions
                    .iter()
                    .all(|t| t.start + t.count <= addr::YEAR || t.start >= 66),
                "{gap_fill:?}: {transactions:?}"
            );
            let writes = device(&store).writes();
            assert_eq!(writes.len(), 2);
            assert!(writes[0].is_single_write());
            assert_eq!(writes[0].start, addr::OUTPUT);
            assert_eq!((writes[1].start, writes[1].count), (70, 3));
            assert_eq!(device(&store).registers(70, 3), vec![1, 0, 3]);
            assert_eq!(
                device(&store).registers(55, 8),
                vec![11, 22, 33, 44, 55, 66, 77, 88]
            );
            assert_eq!(device(&store).register(addr::YEAR), 2024);
        }
    }

    #[test]
    fn calibration_is_written_only_where_named() {
        let mut psu = MockDevice::rd6006();
        psu.set_registers(55, &[11, 22, 33, 44, 55, 66, 77, 88]);
        let mut store = synced(psu);
        store.write_register(55, 12, WriteMode::Cached).unwrap();
        store.write_register(62, 89, WriteMode::Cached).unwrap();
        store.write_register(addr::OUTPUT, 0, WriteMode::Cached).unwrap();
        store.flush_write_cache().unwrap();

        let transactions = device(&store).transactions().to_vec();
        assert!(transactions.iter().all(|t| !t.is_read()));
        let calibration: Vec<_> = transactions
            .iter()
            .filter(|t| t.start <= 62 && t.start + t.count > 55)
            .map(|t| (t.start, t.count, t.is_single_write()))
            .collect();
        assert_eq!(calibration, vec![(55, 1, true), (62, 1, true)]);
        assert_eq!(
            device(&store).registers(55, 8),
            vec![12, 22, 33, 44, 55, 66, 77, 89]
        );
    }

    #[test]
    fn discarded_writes_never_reach_the_device() {
        let mut store = synced(MockDevice::rd6006());
        store.write_register(addr::V_SET, 1200, WriteMode::Cached).unwrap();
        store.write_register(addr::OUTPUT, 0, WriteMode::Cached).unwrap();
        assert_eq!(store.discard_pending_writes(), 2);
        assert_eq!(store.discard_pending_writes(), 0);
        store.close();

        assert!(device(&store).writes().is_empty());
        assert_eq!(device(&store).register(addr::V_SET), 500);
    }

    #[test]
    fn immediate_write_bypasses_cache() {
        let mut store = synced(MockDevice::rd6006());
        store.write_register(addr::V_SET, 700, WriteMode::Cached).unwrap();
        store.write_register(addr::V_SET, 900, WriteMode::Immediate).unwrap();
        assert!(store.pending_writes().is_empty());
        assert_eq!(device(&store).transactions().len(), 1);
        assert_eq!(device(&store).register(addr::V_SET), 900);
    }

    #[test]
    fn staleness_policy() {
        let mut store = store(MockDevice::rd6006());
        store.sync(false).unwrap();
        store.sync(false).unwrap();
        let state_reads = device(&store)
            .reads()
            .iter()
            .filter(|t| t.start <= STATE_RESYNC_START)
            .count();
        assert_eq!(state_reads, 1);

        store.sync(true).unwrap();
        let last = *device(&store).transactions().last().unwrap();
        assert!(last.is_read());
        assert_eq!((last.start, last.count), (4, 17));
    }

    #[test]
    fn expired_mirror_is_refreshed() {
        let mut store = synced(MockDevice::rd6006()).with_staleness(Duration::ZERO);
        store.sync(false).unwrap();
        assert_eq!(device(&store).reads().len(), 1);
    }

    #[test]
    fn write_triggers_state_read() {
        let mut store = synced(MockDevice::rd6006());
        store.write_register(addr::OUTPUT, 0, WriteMode::Cached).unwrap();
        store.sync(false).unwrap();
        let transactions = device(&store).transactions().to_vec();
        assert_eq!(transactions.len(), 2);
        assert!(transactions[1].is_read());
    }

    #[test]
    fn refresh_request_triggers_state_read() {
        let mut store = synced(MockDevice::rd6006());
        store.request_refresh();
        store.sync(false).unwrap();
        assert_eq!(device(&store).reads().len(), 1);
        store.sync(false).unwrap();
        assert_eq!(device(&store).reads().len(), 1);
    }

    #[test]
    fn battery_mode_reads_full_block() {
        let mut mock = MockDevice::rd6006();
        mock.set_registers(addr::BAT_MODE, &[1, 1350]);
        let mut store = synced(mock);
        assert!(store.is_battery_mode());
        store.sync(true).unwrap();
        let read = device(&store).reads()[0];
        assert_eq!((read.start, read.count), (4, 38));
    }

    #[test]
    fn forced_battery_mode() {
        let mut store = store(MockDevice::rd6006()).with_battery_mode(Some(true));
        store.sync(false).unwrap();
        assert!(store.is_battery_mode());

        let mut mock = MockDevice::rd6006();
        mock.set_registers(addr::BAT_MODE, &[1]);
        let mut store = store_with(mock, Some(false));
        store.sync(false).unwrap();
        assert!(!store.is_battery_mode());
    }

    fn store_with(device: MockDevice, battery: Option<bool>) -> RegisterStore<MockDevice> {
        store(device).with_battery_mode(battery)
    }

    #[test]
    fn dual_range_follows_range_register() {
        let mut mock = MockDevice::rd6006();
        mock.set_registers(addr::ID, &[60125]);
        let mut store = synced(mock);
        assert_eq!(store.profile().unwrap().current_scale(), 10000);

        store
            .modbus_mut()
            .transport_mut()
            .set_registers(addr::I_RANGE, &[1]);
        store.sync(true).unwrap();
        assert!(store.profile().unwrap().is_high_range());
        assert_eq!(store.profile().unwrap().current_scale(), 1000);
    }

    #[test]
    fn read_register_uses_mirror_unless_forced() {
        let mut store = synced(MockDevice::rd6006());
        assert_eq!(store.read_register("V_SET", false).unwrap(), 500);
        assert!(device(&store).transactions().is_empty());

        store
            .modbus_mut()
            .transport_mut()
            .set_registers(addr::V_SET, &[650]);
        assert_eq!(store.read_register("v_set", true).unwrap(), 650);
        assert_eq!(store.value(addr::V_SET), Some(650));

        assert_eq!(store.read_register(72u16, false).unwrap(), 0);
        assert_eq!(device(&store).reads().len(), 2);
    }

    #[test]
    fn unknown_register_is_a_usage_fault() {
        let mut store = synced(MockDevice::rd6006());
        assert_matches!(
            store.read_register("NOPE", false),
            Err(Error::UnknownRegister(name)) if name == "NOPE"
        );
        assert!(device(&store).transactions().is_empty());
    }

    #[test]
    fn read_and_write_registers_in_chunks() {
        let mut store = synced(MockDevice::rd6006());
        let words = store.read_registers(0u16, 200).unwrap();
        assert_eq!(words.len(), 200);
        assert_eq!(device(&store).reads().len(), 2);

        let values: Vec<u16> = (0..130).collect();
        store.write_registers(1000u16, &values).unwrap();
        assert_eq!(device(&store).writes().len(), 2);
        assert_eq!(device(&store).register(1129), 129);
        assert_eq!(store.value(1129), Some(129));
    }

    #[test]
    fn u32_values() {
        let mut store = synced(MockDevice::rd6006());
        assert_eq!(store.get_u32("SN_H").unwrap(), 12345);
        store
            .modbus_mut()
            .transport_mut()
            .set_registers(200, &[1, 2]);
        assert_eq!(store.get_u32(200u16).unwrap(), 65538);
    }

    #[test]
    fn changes_skip_noisy_registers() {
        let mut store = synced(MockDevice::rd6006());
        store
            .modbus_mut()
            .transport_mut()
            .set_registers(addr::V_IN, &[2300]);
        store.write_register(addr::V_SET, 700, WriteMode::Cached).unwrap();
        let changes = store.changes().unwrap();
        assert_eq!(
            changes,
            vec![RegisterChange {
                address: addr::V_SET,
                previous: Some(500),
                current: Some(700),
            }]
        );
        assert_eq!(store.value(addr::V_IN), Some(2300));

        store.save_snapshot();
        assert!(store.changes().unwrap().is_empty());
    }

    #[test]
    fn retry_exhaustion_is_fatal() {
        let mut mock = MockDevice::rd6006();
        mock.set_silent(true);
        let mut store = store(mock);
        let error = store.sync(false).unwrap_err();
        assert_matches!(error, Error::RetriesExhausted { attempts: 3 });
        assert_eq!(error.exit_code(), 10);
        assert!(store.mirror().is_empty());
        assert_matches!(store.sync(false), Err(Error::RetriesExhausted { .. }));
    }

    #[test]
    fn failed_read_leaves_mirror_untouched() {
        let mut store = synced(MockDevice::rd6006());
        store
            .modbus_mut()
            .transport_mut()
            .set_registers(addr::V_SET, &[999]);
        for _ in 0..3 {
            store
                .modbus_mut()
                .transport_mut()
                .inject(Fault::Exception(ExceptionCode::ServerDeviceBusy));
        }
        assert!(store.read_register(addr::V_SET, true).is_err());
        assert_eq!(store.value(addr::V_SET), Some(500));
    }

    #[test]
    fn unsupported_model_is_fatal() {
        let mut mock = MockDevice::rd6006();
        mock.set_registers(addr::ID, &[5005]);
        let mut store = store(mock);
        let error = store.sync(false).unwrap_err();
        assert_matches!(error, Error::UnsupportedModel { id: 5005, .. });
        assert_eq!(error.exit_code(), 50);
        assert!(store.mirror().is_empty());
        assert_eq!(device(&store).transactions().len(), 1);
    }
}
