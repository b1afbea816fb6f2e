//! Per-node event registration tables
//!
//! A node holds one table for events it consumes and one for events it
//! produces: a list of singleton registrations with status plus a list of
//! power-of-two range registrations [3; 3.2]. A range overlapping a
//! singleton keeps both registrations.

use emlcb_core::{EventId, EventRange, EventStatus};
use heapless::Vec;

#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TableFull;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EventEntry {
    pub id: EventId,
    pub status: EventStatus,
}

pub struct EventTable<const N: usize, const NR: usize> {
    entries: Vec<EventEntry, N>,
    ranges: Vec<EventRange, NR>,
}

impl<const N: usize, const NR: usize> EventTable<N, NR> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            ranges: Vec::new(),
        }
    }

    /// Registers a singleton event; re-registering updates the status.
    pub fn register(&mut self, id: EventId, status: EventStatus) -> Result<(), TableFull> {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == id) {
            entry.status = status;
            return Ok(());
        }
        self.entries
            .push(EventEntry { id, status })
            .map_err(|_| TableFull)
    }

    pub fn register_range(&mut self, range: EventRange) -> Result<(), TableFull> {
        if self.ranges.iter().any(|existing| *existing == range) {
            return Ok(());
        }
        self.ranges.push(range).map_err(|_| TableFull)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.ranges.clear();
    }

    pub fn find(&self, id: EventId) -> Option<&EventEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn set_status(&mut self, id: EventId, status: EventStatus) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.status = status;
                true
            }
            None => false,
        }
    }

    /// True when the event is registered as a singleton or covered by a range.
    pub fn holds(&self, id: EventId) -> bool {
        self.find(id).is_some() || self.in_range(id)
    }

    pub fn in_range(&self, id: EventId) -> bool {
        self.ranges.iter().any(|range| range.contains(id))
    }

    pub fn entries(&self) -> &[EventEntry] {
        &self.entries
    }

    pub fn ranges(&self) -> &[EventRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binds an event into the first free slot, for Event Learn [3; 3.6]
    pub fn learn(&mut self, id: EventId) -> Result<(), TableFull> {
        if self.find(id).is_some() {
            return Ok(());
        }
        self.entries
            .push(EventEntry {
                id,
                status: EventStatus::Unknown,
            })
            .map_err(|_| TableFull)
    }
}

impl<const N: usize, const NR: usize> Default for EventTable<N, NR> {
    fn default() -> Self {
        Self::new()
    }
}
