use std::{
    collections::{HashMap, HashSet},
    os::fd::RawFd,
};

use hwio_bus::BusDeviceId;

/// Per-accepted-connection state.
#[derive(Debug)]
pub struct ClientInfo {
    pub id: usize,
    pub fd: RawFd,
    pub owned: HashSet<BusDeviceId>,
    pub last_query: Vec<BusDeviceId>,
}

/// Slot array indexed by client id, plus the fd-to-client map, plus the
/// single cross-client invariant this protocol needs: exclusive device
/// ownership.
///
/// Slot reuse policy: the lowest free slot index is always taken first,
/// giving dense, stable small ids. An O(n) scan rather than a free-list
/// — see DESIGN.md.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    slots: Vec<Option<ClientInfo>>,
    fd_to_slot: HashMap<RawFd, usize>,
    /// Device id -> id of the client slot that currently owns it. The only
    /// cross-client invariant: a key present here can belong to at most
    /// one client at a time.
    owners: HashMap<BusDeviceId, usize>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fd_to_slot.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Accepts a new client on `fd`, placing it in the first empty slot
    /// (or appending if none). Returns the assigned client id.
    pub fn add_client(&mut self, fd: RawFd) -> usize {
        let id = self.slots.iter().position(Option::is_none).unwrap_or(self.slots.len());
        let info = ClientInfo { id, fd, owned: HashSet::new(), last_query: Vec::new() };
        if id < self.slots.len() {
            self.slots[id] = Some(info);
        } else {
            self.slots.push(Some(info));
        }
        self.fd_to_slot.insert(fd, id);
        debug_assert!(self.check_invariants());
        id
    }

    pub fn client_by_fd(&self, fd: RawFd) -> Option<&ClientInfo> {
        self.fd_to_slot.get(&fd).and_then(|&id| self.slots[id].as_ref())
    }

    pub fn client_by_fd_mut(&mut self, fd: RawFd) -> Option<&mut ClientInfo> {
        let id = *self.fd_to_slot.get(&fd)?;
        self.slots[id].as_mut()
    }

    pub fn client_by_id(&self, id: usize) -> Option<&ClientInfo> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    pub fn client_by_id_mut(&mut self, id: usize) -> Option<&mut ClientInfo> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    /// Iterates over every live client.
    pub fn iter(&self) -> impl Iterator<Item = &ClientInfo> {
        self.slots.iter().filter_map(Option::as_ref)
    }

    /// Returns the id of the client owning `device`, if any.
    pub fn owner_of(&self, device: BusDeviceId) -> Option<usize> {
        self.owners.get(&device).copied()
    }

    pub fn is_owned_by(&self, device: BusDeviceId, client_id: usize) -> bool {
        self.owners.get(&device) == Some(&client_id)
    }

    /// Grants `client_id` ownership of `device`, provided it is currently
    /// unowned or already owned by that same client (idempotent). Returns
    /// `false` if some other client already owns it — the caller (the
    /// QUERY handler) is expected to simply skip such devices rather than
    /// error, since ownership racing a concurrent query is a normal
    /// outcome, not a protocol violation.
    pub fn try_reserve(&mut self, client_id: usize, device: BusDeviceId) -> bool {
        match self.owners.get(&device) {
            Some(&owner) if owner != client_id => false,
            _ => {
                self.owners.insert(device, client_id);
                if let Some(Some(client)) = self.slots.get_mut(client_id) {
                    client.owned.insert(device);
                }
                debug_assert!(self.check_invariants());
                true
            }
        }
    }

    /// Destroys the client on `fd`: releases every device it owns back to
    /// the bus, removes it from the fd map, nulls its slot. Spec.md §4.5
    /// requires these to happen together as a single step; modelling
    /// teardown as one function call is how this implementation makes
    /// partial teardown structurally unreachable.
    pub fn disconnect(&mut self, fd: RawFd) -> Option<ClientInfo> {
        let id = self.fd_to_slot.remove(&fd)?;
        let client = self.slots[id].take()?;
        for device in &client.owned {
            self.owners.remove(device);
        }
        debug_assert!(self.check_invariants());
        Some(client)
    }

    /// Checks that slot count, fd map size, and the fd<->slot mapping
    /// agree. Used in `debug_assert!`s and directly by tests.
    pub fn check_invariants(&self) -> bool {
        let live = self.iter().count();
        if live != self.fd_to_slot.len() {
            return false;
        }
        for (&fd, &id) in &self.fd_to_slot {
            match self.slots.get(id).and_then(Option::as_ref) {
                Some(client) if client.fd == fd && client.id == id => {}
                _ => return false,
            }
        }
        // Ownership map agrees with each client's owned set.
        for client in self.iter() {
            for device in &client.owned {
                if self.owners.get(device) != Some(&client.id) {
                    return false;
                }
            }
        }
        for (&device, &owner_id) in &self.owners {
            match self.slots.get(owner_id).and_then(Option::as_ref) {
                Some(client) if client.owned.contains(&device) => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_lowest_free_slot() {
        let mut reg = ClientRegistry::new();
        let a = reg.add_client(3);
        let b = reg.add_client(4);
        assert_eq!((a, b), (0, 1));
        reg.disconnect(3);
        let c = reg.add_client(5);
        assert_eq!(c, 0, "freed slot 0 must be reused before appending a new one");
        assert!(reg.check_invariants());
    }

    #[test]
    fn ownership_is_exclusive_across_clients() {
        let mut reg = ClientRegistry::new();
        let a = reg.add_client(1);
        let b = reg.add_client(2);
        let dev = BusDeviceId(7);
        assert!(reg.try_reserve(a, dev));
        assert!(!reg.try_reserve(b, dev), "device already owned by a different client");
        assert!(reg.is_owned_by(dev, a));
        assert!(reg.check_invariants());
    }

    #[test]
    fn disconnect_releases_all_owned_devices() {
        let mut reg = ClientRegistry::new();
        let a = reg.add_client(1);
        let dev = BusDeviceId(9);
        reg.try_reserve(a, dev);
        reg.disconnect(1);
        assert_eq!(reg.owner_of(dev), None, "device must be free for reservation again");
        assert!(reg.check_invariants());
    }

    #[test]
    fn p1_counts_stay_consistent_across_churn() {
        let mut reg = ClientRegistry::new();
        for fd in 1..=5 {
            reg.add_client(fd);
        }
        reg.disconnect(3);
        reg.disconnect(1);
        reg.add_client(10);
        assert_eq!(reg.len(), reg.iter().count());
        assert!(reg.check_invariants());
    }
}
