//! Contract for the hardware bus/device layer the server dispatches
//! register I/O against.
//!
//! The actual bus drivers, device abstractions, and the query/matching
//! engine that resolves a device spec into matching devices are external
//! collaborators — only their contract is given here. [`MockBus`] is a
//! minimal in-memory implementation good enough to drive the server end
//! to end and in integration tests; a real memory-mapped-register bus is
//! out of scope.

use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
};

/// Id of a device as the bus layer knows it (distinct from the
/// server-issued, per-session [`hwio_server`]-level device handle, though
/// `MockBus`/the dispatcher happen to use the same numeric space).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusDeviceId(pub u32);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("unknown device {0:?}")]
    UnknownDevice(BusDeviceId),
    #[error("access out of range: offset {offset} size {size} exceeds device length {len}")]
    OutOfRange { offset: u32, size: u32, len: u32 },
    #[error("bus-internal error: {0}")]
    Internal(String),
}

/// Contract a concrete bus/device backend must satisfy for the dispatcher
/// to drive it. `&self` throughout: backends are expected to use interior
/// mutability, since the dispatcher only ever runs on the single server
/// thread and never needs exclusive `&mut` access across calls.
pub trait Bus: Send + Sync {
    /// Resolves a query specification (one [`hwio_proto::DevQueryItem`]
    /// name, already decoded) into zero or more matching device ids.
    fn query(&self, spec: &str) -> Vec<BusDeviceId>;

    /// Reads `size` bytes starting at `offset` from the given device.
    fn read(&self, id: BusDeviceId, offset: u32, size: u32) -> Result<Vec<u8>, BusError>;

    /// Writes `data` starting at `offset` into the given device.
    fn write(&self, id: BusDeviceId, offset: u32, data: &[u8]) -> Result<(), BusError>;

    /// Forwards an opaque, device-defined remote call.
    fn remote_call(&self, id: BusDeviceId, payload: &[u8]) -> Result<Vec<u8>, BusError>;

    /// Whether `id` currently names a live device (used to validate a
    /// handle the dispatcher is about to use after ownership has already
    /// been checked).
    fn exists(&self, id: BusDeviceId) -> bool;
}

struct MockDevice {
    name: String,
    registers: Mutex<Vec<u8>>,
}

/// In-memory [`Bus`] backed by flat byte-addressable register files.
///
/// Query matching is a simple substring match against the device name —
/// real query-engine semantics (bus/address/class matching) are the
/// external collaborator's job, not this mock's.
pub struct MockBus {
    devices: RwLock<HashMap<BusDeviceId, MockDevice>>,
    next_id: Mutex<u32>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    pub fn new() -> Self {
        Self { devices: RwLock::new(HashMap::new()), next_id: Mutex::new(1) }
    }

    /// Registers a new device with `len` zeroed register bytes, returning
    /// its id.
    pub fn add_device(&self, name: impl Into<String>, len: usize) -> BusDeviceId {
        let mut next_id = self.next_id.lock().unwrap();
        let id = BusDeviceId(*next_id);
        *next_id += 1;
        self.devices
            .write()
            .unwrap()
            .insert(id, MockDevice { name: name.into(), registers: Mutex::new(vec![0u8; len]) });
        id
    }

    /// Builds a `MockBus` pre-populated with `(name, register_len)` pairs,
    /// as used by `hwio-cli serve --device name:size`.
    pub fn with_devices(devices: impl IntoIterator<Item = (String, usize)>) -> Self {
        let bus = Self::new();
        for (name, len) in devices {
            bus.add_device(name, len);
        }
        bus
    }
}

impl Bus for MockBus {
    fn query(&self, spec: &str) -> Vec<BusDeviceId> {
        let devices = self.devices.read().unwrap();
        let mut ids: Vec<_> = devices
            .iter()
            .filter(|(_, d)| d.name.contains(spec))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn read(&self, id: BusDeviceId, offset: u32, size: u32) -> Result<Vec<u8>, BusError> {
        let devices = self.devices.read().unwrap();
        let dev = devices.get(&id).ok_or(BusError::UnknownDevice(id))?;
        let regs = dev.registers.lock().unwrap();
        let (start, end) = range_for(offset, size, regs.len())?;
        Ok(regs[start..end].to_vec())
    }

    fn write(&self, id: BusDeviceId, offset: u32, data: &[u8]) -> Result<(), BusError> {
        let devices = self.devices.read().unwrap();
        let dev = devices.get(&id).ok_or(BusError::UnknownDevice(id))?;
        let mut regs = dev.registers.lock().unwrap();
        let (start, end) = range_for(offset, data.len() as u32, regs.len())?;
        regs[start..end].copy_from_slice(data);
        Ok(())
    }

    fn remote_call(&self, id: BusDeviceId, payload: &[u8]) -> Result<Vec<u8>, BusError> {
        if !self.exists(id) {
            return Err(BusError::UnknownDevice(id));
        }
        // Mock behaviour only: echo the payload back reversed so tests can
        // tell a remote-call reply apart from a plain echo.
        Ok(payload.iter().rev().copied().collect())
    }

    fn exists(&self, id: BusDeviceId) -> bool {
        self.devices.read().unwrap().contains_key(&id)
    }
}

fn range_for(offset: u32, size: u32, len: usize) -> Result<(usize, usize), BusError> {
    let start = offset as usize;
    let end = start.saturating_add(size as usize);
    if end > len {
        return Err(BusError::OutOfRange { offset, size, len: len as u32 });
    }
    Ok((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_matches_by_substring() {
        let bus = MockBus::new();
        let gpio = bus.add_device("gpio0", 16);
        let _uart = bus.add_device("uart0", 16);
        assert_eq!(bus.query("gpio"), vec![gpio]);
    }

    #[test]
    fn read_write_round_trip() {
        let bus = MockBus::new();
        let dev = bus.add_device("reg", 8);
        bus.write(dev, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(bus.read(dev, 0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn out_of_range_read_is_rejected() {
        let bus = MockBus::new();
        let dev = bus.add_device("reg", 4);
        assert_eq!(
            bus.read(dev, 2, 4),
            Err(BusError::OutOfRange { offset: 2, size: 4, len: 4 })
        );
    }

    #[test]
    fn unknown_device_is_rejected() {
        let bus = MockBus::new();
        assert_eq!(bus.read(BusDeviceId(999), 0, 1), Err(BusError::UnknownDevice(BusDeviceId(999))));
    }
}
