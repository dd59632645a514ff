//! Connection handles and the fixed-capacity connection table
//!
//! Each slot carries a generation counter that is bumped on every
//! allocation, so a handle kept past the release of its slot is rejected
//! instead of aliasing whatever connection reuses the slot.

use std::fmt;

use super::error::{Result, WebsocketError};

/// Reference to one connection table slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionHandle {
    slot: u16,
    generation: u32,
}

impl ConnectionHandle {
    /// Slot index within the owning table
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    record: Option<T>,
}

/// Arena of connection records
///
/// Capacity is fixed at construction. A slot is IDLE when it holds no
/// record.
pub struct ConnectionTable<T> {
    slots: Vec<Slot<T>>,
}

impl<T> ConnectionTable<T> {
    /// Table of `capacity` IDLE slots, at most 65536
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize + 1);
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                record: None,
            })
            .collect();
        Self { slots }
    }

    /// Number of slots, IDLE or not
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of non-IDLE slots
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No IDLE slot is left
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(|s| s.record.is_some())
    }

    /// Place `record` in the first IDLE slot
    pub fn allocate(&mut self, record: T) -> Result<ConnectionHandle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.record.is_none())
            .ok_or(WebsocketError::NoResources)?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.record = Some(record);
        Ok(ConnectionHandle {
            slot: index as u16,
            generation: slot.generation,
        })
    }

    /// Return the slot to IDLE and hand back its record
    ///
    /// Releasing an already released or stale handle is a no-op.
    pub fn release(&mut self, handle: ConnectionHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.slot())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.record.take()
    }

    /// Record behind `handle`, `None` if the handle is stale
    pub fn get(&self, handle: ConnectionHandle) -> Option<&T> {
        self.slots
            .get(handle.slot())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.record.as_ref())
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.slot())
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.record.as_mut())
    }

    /// Like [`ConnectionTable::get_mut`] but reports a stale handle
    pub fn lookup(&mut self, handle: ConnectionHandle) -> Result<&mut T> {
        self.get_mut(handle).ok_or(WebsocketError::BadParam)
    }

    /// Handles of all non-IDLE slots, in slot order
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.record.is_some())
            .map(|(index, s)| ConnectionHandle {
                slot: index as u16,
                generation: s.generation,
            })
            .collect()
    }

    /// Every live record together with its handle
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionHandle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, s)| {
            let generation = s.generation;
            s.record.as_mut().map(|r| {
                (
                    ConnectionHandle {
                        slot: index as u16,
                        generation,
                    },
                    r,
                )
            })
        })
    }

    /// Handle of the first live record matching `pred`
    pub fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Option<ConnectionHandle> {
        self.slots.iter().enumerate().find_map(|(index, s)| match &s.record {
            Some(r) if pred(r) => Some(ConnectionHandle {
                slot: index as u16,
                generation: s.generation,
            }),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_until_full() {
        let mut table = ConnectionTable::with_capacity(2);
        let a = table.allocate("a").unwrap();
        let b = table.allocate("b").unwrap();
        assert_ne!(a, b);
        assert!(table.is_full());
        assert_eq!(table.allocate("c").unwrap_err(), WebsocketError::NoResources);
    }

    #[test]
    fn test_first_idle_slot_is_reused() {
        let mut table = ConnectionTable::with_capacity(3);
        let a = table.allocate(1).unwrap();
        let _b = table.allocate(2).unwrap();
        assert_eq!(table.release(a), Some(1));
        let c = table.allocate(3).unwrap();
        assert_eq!(c.slot(), a.slot());
        assert_ne!(c.generation(), a.generation());
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut table = ConnectionTable::with_capacity(1);
        let old = table.allocate("old").unwrap();
        table.release(old);
        let new = table.allocate("new").unwrap();

        assert!(table.get(old).is_none());
        assert_eq!(table.lookup(old).unwrap_err(), WebsocketError::BadParam);
        assert_eq!(table.get(new), Some(&"new"));
        // stale release must not free the new connection
        assert_eq!(table.release(old), None);
        assert_eq!(table.get(new), Some(&"new"));
    }

    #[test]
    fn test_double_release_is_noop() {
        let mut table = ConnectionTable::with_capacity(1);
        let h = table.allocate(7).unwrap();
        assert_eq!(table.release(h), Some(7));
        assert_eq!(table.release(h), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_handles_in_slot_order() {
        let mut table = ConnectionTable::with_capacity(4);
        let a = table.allocate('a').unwrap();
        let b = table.allocate('b').unwrap();
        let c = table.allocate('c').unwrap();
        table.release(b);
        assert_eq!(table.handles(), vec![a, c]);
        assert_eq!(table.find(|r| *r == 'c'), Some(c));
        assert_eq!(table.len(), 2);
    }
}
