//! Inaccessible sentinel pages flanking tracked mappings.
//!
//! Placement is best effort. A guard is mapped with `MAP_FIXED_NOREPLACE` at the
//! page right below or right above its mapping; if something already lives there
//! the kernel refuses and the record simply goes without that guard.

use tracing::{trace, warn};

use crate::{page_floor, MappingRecord, Primitives};

pub struct GuardPages<'a, P: Primitives> {
    primitives: &'a P,
}

impl<'a, P: Primitives> GuardPages<'a, P> {
    pub fn new(primitives: &'a P) -> Self {
        GuardPages { primitives }
    }

    fn page_size(&self) -> usize {
        self.primitives.page_size()
    }

    unsafe fn map_guard(&self, at: usize) -> Option<usize> {
        let page_size = self.page_size();
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;
        match self.primitives.map(at, page_size, libc::PROT_NONE, flags, -1, 0) {
            Ok(addr) if addr == at => {
                trace!(addr = format_args!("{addr:#x}"), "mapped guard page");
                Some(addr)
            }
            Ok(addr) => {
                // Pre-4.17 kernels treat the flag as a plain hint.
                let _ = self.primitives.unmap(addr, page_size);
                warn!(
                    wanted = format_args!("{at:#x}"),
                    got = format_args!("{addr:#x}"),
                    "guard page landed elsewhere, dropped it"
                );
                None
            }
            Err(errno) => {
                warn!(addr = format_args!("{at:#x}"), errno, "could not place guard page");
                None
            }
        }
    }

    unsafe fn unmap_guard(&self, addr: usize) {
        match self.primitives.unmap(addr, self.page_size()) {
            Ok(()) => trace!(addr = format_args!("{addr:#x}"), "unmapped guard page"),
            Err(errno) => warn!(addr = format_args!("{addr:#x}"), errno, "could not unmap guard page"),
        }
    }

    /// Maps a guard at the page right below `record.base`, unless one is already there.
    pub unsafe fn place_below(&self, record: &mut MappingRecord) {
        let page_size = self.page_size();
        if record.guard_below.is_some() || record.base < page_size {
            return;
        }
        record.guard_below = self.map_guard(page_floor(record.base - 1, page_size));
    }

    /// Maps a guard at the first page past the page-rounded end of `record`.
    pub unsafe fn place_above(&self, record: &mut MappingRecord) {
        if record.guard_above.is_some() {
            return;
        }
        let at = record.end(self.page_size());
        record.guard_above = self.map_guard(at);
    }

    pub unsafe fn place_all(&self, record: &mut MappingRecord) {
        self.place_below(record);
        self.place_above(record);
    }

    pub unsafe fn remove_below(&self, record: &mut MappingRecord) {
        if let Some(addr) = record.guard_below.take() {
            self.unmap_guard(addr);
        }
    }

    pub unsafe fn remove_above(&self, record: &mut MappingRecord) {
        if let Some(addr) = record.guard_above.take() {
            self.unmap_guard(addr);
        }
    }

    pub unsafe fn remove_all(&self, record: &mut MappingRecord) {
        self.remove_below(record);
        self.remove_above(record);
    }

    /// Moves `record` to `[base, base + length)`, taking its guards along.
    ///
    /// The old guards are removed first and the record's range is only updated
    /// afterwards, so the guard fields never describe a mix of old and new positions.
    pub unsafe fn rehome(&self, record: &mut MappingRecord, base: usize, length: usize, place: bool) {
        self.remove_all(record);
        record.base = base;
        record.length = length;
        if place {
            self.place_all(record);
        }
    }
}

/// Drops guard fields that point into `[start, end)` without unmapping them; the
/// caller has already replaced or released that range.
pub fn forget_within(record: &mut MappingRecord, start: usize, end: usize) {
    let inside = |guard: Option<usize>| guard.is_some_and(|g| g >= start && g < end);
    if inside(record.guard_below) {
        record.guard_below = None;
    }
    if inside(record.guard_above) {
        record.guard_above = None;
    }
}
