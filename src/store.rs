//! Last known state of every slave seen on the bus.

use crate::protocol as proto;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio_modbus::SlaveId;

/// Everything learned about one slave from observed traffic.
///
/// `None` means the value has never been observed; the record itself exists
/// as soon as any traffic mentions the slave.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SlaveData {
    pub slave: SlaveId,
    /// Room temperature in °C from the discovery block.
    pub temperature: Option<f32>,
    /// Relative humidity in % from the discovery block.
    pub humidity: Option<f32>,
    /// Coil states, coil 1 at index 0.
    pub coils: Option<Vec<bool>>,
    /// Holding registers from the monitored ranges, as signed values.
    pub registers: Option<BTreeMap<u16, i16>>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub last_seen: Instant,
    pub available: bool,
}

impl SlaveData {
    /// A freshly discovered slave for which no value has been accepted yet.
    pub fn new(slave: SlaveId, now: Instant) -> Self {
        Self {
            slave,
            temperature: None,
            humidity: None,
            coils: None,
            registers: None,
            last_seen: now,
            available: false,
        }
    }

    /// Records that an update was accepted at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.available = true;
    }

    pub fn register(&self, address: u16) -> Option<i16> {
        self.registers.as_ref()?.get(&address).copied()
    }

    /// Coil state by 1-based coil number.
    pub fn coil(&self, number: usize) -> Option<bool> {
        let index = number.checked_sub(1)?;
        self.coils.as_ref()?.get(index).copied()
    }

    /// Target temperature in °C as last read back from the setpoint register.
    pub fn setpoint(&self) -> Option<f32> {
        self.register(proto::SETPOINT_REG_ADDR)
            .map(|raw| proto::decode_tenths(raw as u16))
    }

    /// `Some(true)` while the zone is heating.
    pub fn heating_active(&self) -> Option<bool> {
        self.register(proto::HEATING_STATUS_REG_ADDR)
            .map(|status| status == 1)
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// Map of discovered slaves. Entries are never removed.
#[derive(Debug, Default, Clone)]
pub struct SlaveStore {
    slaves: BTreeMap<SlaveId, SlaveData>,
}

impl SlaveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, slave: SlaveId) -> Option<&SlaveData> {
        self.slaves.get(&slave)
    }

    pub fn contains(&self, slave: SlaveId) -> bool {
        self.slaves.contains_key(&slave)
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    /// Copy of every slave record.
    pub fn all(&self) -> BTreeMap<SlaveId, SlaveData> {
        self.slaves.clone()
    }

    /// Returns the record for `slave`, creating an unavailable one if it is unknown.
    pub(crate) fn entry(&mut self, slave: SlaveId, now: Instant) -> &mut SlaveData {
        self.slaves.entry(slave).or_insert_with(|| {
            log::info!("Discovered new slave {slave}");
            SlaveData::new(slave, now)
        })
    }

    /// Marks every slave not updated within `timeout` as unavailable.
    ///
    /// Returns `true` if at least one slave changed state.
    pub fn mark_unavailable_if_stale(&mut self, now: Instant, timeout: Duration) -> bool {
        let mut changed = false;
        for data in self.slaves.values_mut() {
            if data.available && data.is_stale(now, timeout) {
                data.available = false;
                changed = true;
                log::warn!("Slave {} marked unavailable", data.slave);
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(300);

    #[test]
    fn new_slave_is_unavailable_until_touched() {
        let now = Instant::now();
        let mut store = SlaveStore::new();
        assert!(store.get(7).is_none());

        let data = store.entry(7, now);
        assert!(!data.available);
        assert_eq!(data.temperature, None);
        data.touch(now);

        assert!(store.get(7).unwrap().available);
        assert_eq!(store.len(), 1);
        assert_eq!(store.all().keys().copied().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn stale_slave_flips_once() {
        let start = Instant::now();
        let mut store = SlaveStore::new();
        store.entry(1, start).touch(start);
        store.entry(2, start).touch(start + Duration::from_secs(200));

        assert!(!store.mark_unavailable_if_stale(start + TIMEOUT, TIMEOUT));
        assert!(store.get(1).unwrap().available);

        let later = start + Duration::from_secs(301);
        assert!(store.mark_unavailable_if_stale(later, TIMEOUT));
        assert!(!store.get(1).unwrap().available);
        assert!(store.get(2).unwrap().available);

        assert!(!store.mark_unavailable_if_stale(later, TIMEOUT));
    }

    #[test]
    fn derived_views() {
        let now = Instant::now();
        let mut data = SlaveData::new(4, now);
        assert_eq!(data.setpoint(), None);
        assert_eq!(data.heating_active(), None);
        assert_eq!(data.coil(1), None);

        data.registers = Some(BTreeMap::from([
            (proto::SETPOINT_REG_ADDR, 215),
            (proto::HEATING_STATUS_REG_ADDR, 1),
            (179, -35),
        ]));
        data.coils = Some(vec![true, false]);

        assert_eq!(data.setpoint(), Some(21.5));
        assert_eq!(data.heating_active(), Some(true));
        assert_eq!(data.register(179), Some(-35));
        assert_eq!(data.register(180), None);
        assert_eq!(data.coil(0), None);
        assert_eq!(data.coil(1), Some(true));
        assert_eq!(data.coil(2), Some(false));
        assert_eq!(data.coil(3), None);
    }
}
