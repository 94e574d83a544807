//! Bookkeeping for tracked anonymous mappings.
//!
//! Records live in a generational arena. A [`Handle`] stays valid for as long as
//! its record does, no matter how the arena is reused, and a stale handle can never
//! resolve to a newer record that happens to occupy the same slot.

use crate::{AccessRights, PkeyAccessRights, ProtectionHistory};

/// Stable identity of a record in a [`MappingStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

/// Execute-only state attached by [`crate::xom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOnly {
    /// Isolation key owned by the record, `None` when plain `PROT_EXEC` was used.
    pub pkey: Option<u32>,
    pub access_rights: PkeyAccessRights,
}

/// One tracked anonymous mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    pub base: usize,
    pub length: usize,
    /// Union of every protection ever applied; never loses a bit.
    pub granted_ever: AccessRights,
    pub current: AccessRights,
    pub guard_below: Option<usize>,
    pub guard_above: Option<usize>,
    pub execute_only: Option<ExecuteOnly>,
}

impl MappingRecord {
    pub fn new(base: usize, length: usize, rights: AccessRights) -> Self {
        MappingRecord {
            base,
            length,
            granted_ever: rights,
            current: rights,
            guard_below: None,
            guard_above: None,
            execute_only: None,
        }
    }

    /// Whether `addr` is the base of this mapping or falls inside it.
    pub fn contains(&self, addr: usize) -> bool {
        addr == self.base || (addr > self.base && addr < self.base + self.length)
    }

    /// Page-rounded length, which is what the kernel actually mapped.
    pub fn span(&self, page_size: usize) -> usize {
        crate::round_up(self.length, page_size)
    }

    /// First address past the page-rounded mapping.
    pub fn end(&self, page_size: usize) -> usize {
        self.base + self.span(page_size)
    }

    /// Applies a successful protection change.
    pub fn record_protection(&mut self, rights: AccessRights) {
        self.current = rights;
        self.granted_ever = self.granted_ever.add(rights);
    }

    pub fn history(&self) -> ProtectionHistory {
        ProtectionHistory {
            granted_ever: self.granted_ever,
            execute_only: self.execute_only.is_some(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<MappingRecord>,
}

/// The authoritative set of tracked mappings.
#[derive(Debug, Default)]
pub struct MappingStore {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl MappingStore {
    pub const fn new() -> Self {
        MappingStore {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MappingStore {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, record: MappingRecord) -> Handle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return Handle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&MappingRecord> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut MappingRecord> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// Finds the record whose range contains `addr`. Linear in the number of records.
    pub fn find_by_address(&self, addr: usize) -> Option<Handle> {
        self.iter()
            .find(|(_, record)| record.contains(addr))
            .map(|(handle, _)| handle)
    }

    /// Removes a record, returning it. Stale handles yield `None`.
    pub fn remove(&mut self, handle: Handle) -> Option<MappingRecord> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(record)
    }

    /// Empties the store, handing every record to `release` first.
    pub fn clear_with<F>(&mut self, mut release: F)
    where
        F: FnMut(MappingRecord),
    {
        for slot in self.slots.drain(..) {
            if let Some(record) = slot.record {
                release(record);
            }
        }
        self.free.clear();
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &MappingRecord)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    record,
                )
            })
        })
    }

    /// Handles of every record overlapping `[start, end)`.
    pub fn overlapping(&self, start: usize, end: usize, page_size: usize) -> Vec<Handle> {
        self.iter()
            .filter(|(_, record)| record.base < end && start < record.end(page_size))
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Handles of every record with a guard page inside `[start, end)`.
    pub fn guarded_within(&self, start: usize, end: usize) -> Vec<Handle> {
        let inside = |guard: Option<usize>| guard.is_some_and(|g| g >= start && g < end);
        self.iter()
            .filter(|(_, record)| inside(record.guard_below) || inside(record.guard_above))
            .map(|(handle, _)| handle)
            .collect()
    }
}
