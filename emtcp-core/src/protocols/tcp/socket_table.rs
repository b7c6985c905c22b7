//! Fixed-capacity storage for control blocks.
//!
//! Every socket lives in one slot of the table. A [`SocketHandle`] names a
//! slot together with the generation it was handed out in, so a handle that
//! outlives its socket is recognized as stale even after the slot is reused.

use super::{tcb::Tcb, AcceptFilter, State};
use crate::protocols::utility::Endpoint;

/// A reference to a socket in the table.
///
/// The handle stays valid until the socket is released. Using it afterwards
/// fails, even once the slot holds a different socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle {
    index: u16,
    generation: u32,
}

impl SocketHandle {
    /// The slot the socket occupies
    pub fn index(&self) -> u16 {
        self.index
    }
}

impl std::fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// A socket along with how it came to be
#[derive(Debug)]
pub struct Entry {
    pub tcb: Tcb,
    /// The listening socket a connection was accepted on. Sockets with a
    /// listener are released by the stack once they close.
    pub listener: Option<SocketHandle>,
    /// Decides which connection requests a listening socket accepts
    pub accept_filter: Option<AcceptFilter>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Which socket an inbound segment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Connection(SocketHandle),
    Listener(SocketHandle),
    Unmatched,
}

#[derive(Debug)]
pub struct SocketTable {
    slots: Vec<Slot>,
}

impl SocketTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity.min(u16::MAX as usize))
                .map(|_| Slot::default())
                .collect(),
        }
    }

    /// Stores a control block in the first free slot.
    pub fn insert(&mut self, tcb: Tcb, listener: Option<SocketHandle>) -> Option<SocketHandle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.entry.is_none())?;
        slot.entry = Some(Entry {
            tcb,
            listener,
            accept_filter: None,
        });
        Some(SocketHandle {
            index: index as u16,
            generation: slot.generation,
        })
    }

    /// Frees the slot, invalidating every handle to it.
    pub fn remove(&mut self, handle: SocketHandle) -> Option<Entry> {
        let slot = self.slot_mut(handle)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(entry)
    }

    pub fn get(&self, handle: SocketHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: SocketHandle) -> Option<&mut Entry> {
        self.slot_mut(handle)?.entry.as_mut()
    }

    fn slot_mut(&mut self, handle: SocketHandle) -> Option<&mut Slot> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        Some(slot)
    }

    /// Finds the socket for a segment sent from `remote` to `local_port`. A
    /// connection bound to exactly these endpoints wins over a socket
    /// listening on the port.
    pub fn lookup(&self, local_port: u16, remote: Endpoint) -> Lookup {
        let mut listener = None;
        for (handle, entry) in self.iter() {
            let id = entry.tcb.id();
            if id.local.port != local_port {
                continue;
            }
            match entry.tcb.state() {
                State::Closed => {}
                State::Listen => {
                    listener.get_or_insert(handle);
                }
                _ => {
                    if id.remote == remote {
                        return Lookup::Connection(handle);
                    }
                }
            }
        }
        listener.map_or(Lookup::Unmatched, Lookup::Listener)
    }

    /// Whether any open socket is bound to the local port
    pub fn port_in_use(&self, port: u16) -> bool {
        self.iter().any(|(_, entry)| {
            entry.tcb.state() != State::Closed && entry.tcb.id().local.port == port
        })
    }

    /// Whether a connection other than a listener already uses both endpoints
    pub fn connection_exists(&self, local_port: u16, remote: Endpoint) -> bool {
        self.iter().any(|(_, entry)| {
            let id = entry.tcb.id();
            entry.tcb.state().is_connected() && id.local.port == local_port && id.remote == remote
        })
    }

    /// Handles to every occupied slot
    pub fn handles(&self) -> Vec<SocketHandle> {
        self.iter().map(|(handle, _)| handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SocketHandle, &Entry)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    SocketHandle {
                        index: index as u16,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    /// The number of occupied slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::TcpConfig,
        protocols::{ip::Ipv4Address, tcp::SocketOptions, utility::Endpoints},
    };

    fn tcb() -> Tcb {
        Tcb::new(TcpConfig::default(), SocketOptions::default())
    }

    #[test]
    fn stale_handles_are_rejected() {
        let mut table = SocketTable::new(1);
        let first = table.insert(tcb(), None).unwrap();
        assert!(table.insert(tcb(), None).is_none());

        assert!(table.remove(first).is_some());
        assert!(table.get(first).is_none());
        assert!(table.remove(first).is_none());

        let second = table.insert(tcb(), None).unwrap();
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert!(table.get_mut(second).is_some());
    }

    #[test]
    fn connection_wins_over_listener() {
        let local = Endpoint::new(Ipv4Address::new([10, 0, 0, 1]).into(), 80);
        let remote = Endpoint::new(Ipv4Address::new([10, 0, 0, 2]).into(), 4000);
        let other = Endpoint::new(Ipv4Address::new([10, 0, 0, 3]).into(), 4000);

        let mut table = SocketTable::new(4);
        let mut listener = tcb();
        listener.listen(80).unwrap();
        let listener = table.insert(listener, None).unwrap();

        let mut connection = tcb();
        connection.open(Endpoints::new(local, remote), 1000).unwrap();
        let connection = table.insert(connection, Some(listener)).unwrap();

        assert_eq!(table.lookup(80, remote), Lookup::Connection(connection));
        assert_eq!(table.lookup(80, other), Lookup::Listener(listener));
        assert_eq!(table.lookup(81, remote), Lookup::Unmatched);
        assert!(table.port_in_use(80));
        assert!(!table.port_in_use(81));
        assert!(table.connection_exists(80, remote));
        assert_eq!(table.len(), 2);
        assert_eq!(table.handles(), vec![listener, connection]);
    }
}
