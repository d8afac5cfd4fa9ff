//! Pairs observed master requests with the slave responses that follow them.
//!
//! Modbus RTU responses carry neither the register address nor a transaction
//! id, so a response can only be interpreted against the request that
//! preceded it. The correlator remembers the last request per slave and
//! request kind and applies a response only if a matching request is
//! pending. A newer request of the same kind replaces the older one.

use crate::protocol::{self as proto, Frame, Payload};
use crate::store::{SlaveData, SlaveStore};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_modbus::{FunctionCode, SlaveId};

/// The polling patterns of the external master that are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Read Coils of the coil block.
    Coils,
    /// Read Holding Registers of one of [`proto::MONITORED_RANGES`], by index.
    Registers(usize),
    /// The temperature/humidity block used to discover slaves.
    Discovery,
}

impl RequestKind {
    /// Classifies a read request, if it is one of the known polling patterns.
    pub fn of_request(function: FunctionCode, address: u16, quantity: u16) -> Option<Self> {
        if function == FunctionCode::ReadCoils
            && address == proto::COIL_START_ADDR
            && quantity == proto::COIL_QUAN
        {
            return Some(Self::Coils);
        }
        if function == FunctionCode::ReadHoldingRegisters {
            if let Some(index) = proto::MONITORED_RANGES
                .iter()
                .position(|range| range.matches(address, quantity))
            {
                return Some(Self::Registers(index));
            }
        }
        if address == proto::DISCOVERY_REG_ADDR && quantity == proto::DISCOVERY_REG_QUAN {
            return Some(Self::Discovery);
        }
        None
    }
}

/// A request waiting for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub issued: Instant,
    /// First register of the request; the response is interpreted against it.
    pub address: u16,
}

impl PendingRequest {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.issued)
    }
}

/// Owns the pending request table and the slave store it updates.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<(SlaveId, RequestKind), PendingRequest>,
    store: SlaveStore,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &SlaveStore {
        &self.store
    }

    pub fn pending(&self, slave: SlaveId, kind: RequestKind) -> Option<&PendingRequest> {
        self.pending.get(&(slave, kind))
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Applies one frame, in the order frames were taken off the stream.
    ///
    /// Returns `true` if the slave store changed.
    pub fn handle_frame(&mut self, frame: &Frame, now: Instant) -> bool {
        match &frame.payload {
            Payload::Request { address, quantity } => {
                self.on_request(frame.slave, frame.function, *address, *quantity, now)
            }
            Payload::Coils(coils) => self.on_coils(frame.slave, coils, now),
            Payload::Registers(values) => self.on_registers(frame.slave, values, now),
            Payload::Unclassified => false,
        }
    }

    /// Marks slaves without recent updates as unavailable.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> bool {
        self.store.mark_unavailable_if_stale(now, timeout)
    }

    fn on_request(
        &mut self,
        slave: SlaveId,
        function: FunctionCode,
        address: u16,
        quantity: u16,
        now: Instant,
    ) -> bool {
        let Some(kind) = RequestKind::of_request(function, address, quantity) else {
            return false;
        };
        let request = PendingRequest {
            issued: now,
            address,
        };
        if let Some(previous) = self.pending.insert((slave, kind), request) {
            log::trace!(
                "Slave {slave}: {kind:?} request replaces one issued {:?} ago",
                previous.age(now)
            );
        }

        // Surface discovered slaves before their values resolve.
        if kind == RequestKind::Discovery && !self.store.contains(slave) {
            self.store.entry(slave, now);
            return true;
        }
        false
    }

    fn on_coils(&mut self, slave: SlaveId, coils: &[bool], now: Instant) -> bool {
        if coils.is_empty() || self.pending.remove(&(slave, RequestKind::Coils)).is_none() {
            return false;
        }
        let data = self.store.entry(slave, now);
        data.coils = Some(coils.iter().take(usize::from(proto::COIL_QUAN)).copied().collect());
        data.touch(now);
        log::debug!(
            "Slave {slave}: Updated {} coils",
            data.coils.as_ref().map_or(0, Vec::len)
        );
        true
    }

    fn on_registers(&mut self, slave: SlaveId, values: &[u16], now: Instant) -> bool {
        if values.is_empty() {
            return false;
        }
        for index in 0..proto::MONITORED_RANGES.len() {
            if let Some(request) = self.pending.remove(&(slave, RequestKind::Registers(index))) {
                let data = self.store.entry(slave, now);
                store_registers(data, request.address, values);
                data.touch(now);
                log::debug!(
                    "Slave {slave}: Updated {} registers (range {}) starting at {}",
                    values.len(),
                    index + 1,
                    request.address
                );
                return true;
            }
        }

        let Some((temperature, humidity)) = proto::decode_discovery(values) else {
            return false;
        };
        if self.pending.remove(&(slave, RequestKind::Discovery)).is_none() {
            return false;
        }
        let data = self.store.entry(slave, now);
        data.temperature = Some(temperature);
        data.humidity = Some(humidity);
        data.touch(now);
        log::debug!("Slave {slave}: Temperature={temperature:.1}°C, Humidity={humidity:.1}%");
        true
    }
}

fn store_registers(data: &mut SlaveData, start: u16, values: &[u16]) {
    let registers = data.registers.get_or_insert_with(Default::default);
    for (address, value) in (start..=u16::MAX).zip(values) {
        registers.insert(address, proto::register_to_signed(*value));
    }
}
