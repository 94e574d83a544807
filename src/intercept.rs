//! The intercepted virtual-memory operations.
//!
//! [`Interceptor`] vets each request with the [`PolicyEngine`], forwards it to the
//! real [`Primitives`] and, with the mapping cache enabled, keeps the
//! [`MappingStore`] and the guard pages in step with what the kernel did. The store
//! lock is held across the real call and the bookkeeping that follows it, and the
//! store is only touched once the real call has succeeded.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::guard::{forget_within, GuardPages};
use crate::store::Handle;
use crate::{
    round_up, AccessRights, Denial, Errno, MapGuardError, MappingRecord, MappingStore,
    PolicyConfig, PolicyEngine, Primitives, POISON_BYTE,
};

/// Arguments of an `mmap` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    pub addr: usize,
    pub length: usize,
    pub prot: i32,
    pub flags: i32,
    pub fd: i32,
    pub offset: i64,
}

impl MapRequest {
    /// A private anonymous mapping placed wherever the kernel likes.
    pub fn anonymous(length: usize, prot: i32) -> Self {
        MapRequest {
            addr: 0,
            length,
            prot,
            flags: libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            fd: -1,
            offset: 0,
        }
    }

    /// A private mapping of `fd` starting at `offset`.
    pub fn file(fd: i32, offset: i64, length: usize, prot: i32) -> Self {
        MapRequest {
            addr: 0,
            length,
            prot,
            flags: libc::MAP_PRIVATE,
            fd,
            offset,
        }
    }

    pub fn at(mut self, addr: usize) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_flags(mut self, flags: i32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags & libc::MAP_ANONYMOUS != 0
    }
}

fn failed(op: &'static str) -> impl FnOnce(Errno) -> MapGuardError {
    move |errno| MapGuardError::SyscallFailed { op, errno }
}

pub struct Interceptor<P: Primitives> {
    policy: PolicyEngine,
    pub(crate) primitives: P,
    pub(crate) store: Mutex<MappingStore>,
}

impl<P: Primitives> Interceptor<P> {
    pub fn new(config: PolicyConfig, primitives: P) -> Self {
        Interceptor {
            policy: PolicyEngine::new(config),
            primitives,
            store: Mutex::new(MappingStore::new()),
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        self.policy.config()
    }

    pub fn primitives(&self) -> &P {
        &self.primitives
    }

    /// A copy of the tracked record covering `addr`.
    pub fn lookup(&self, addr: usize) -> Option<MappingRecord> {
        let store = self.store.lock();
        store
            .find_by_address(addr)
            .and_then(|handle| store.get(handle))
            .cloned()
    }

    pub fn tracked_count(&self) -> usize {
        self.store.lock().len()
    }

    pub(crate) fn page_size(&self) -> usize {
        self.primitives.page_size()
    }

    pub(crate) fn guards(&self) -> GuardPages<'_, P> {
        GuardPages::new(&self.primitives)
    }

    fn deny(
        &self,
        op: &'static str,
        addr: usize,
        length: usize,
        rights: AccessRights,
        denial: Denial,
    ) -> MapGuardError {
        warn!(
            op,
            addr = format_args!("{addr:#x}"),
            length,
            prot = %rights,
            violation = %denial.violation,
            fatal = denial.fatal,
            "request denied"
        );
        denial.into()
    }

    /// Creates a mapping, the `mmap` entry point.
    ///
    /// File-backed requests skip the policy and are never tracked, though tracked
    /// state they replace is still dropped. Anonymous ones are vetted, tracked,
    /// guarded and poisoned according to the configuration.
    ///
    /// # Safety
    ///
    /// Same contract as `mmap(2)`; a fixed request may replace live memory.
    pub unsafe fn create(&self, request: MapRequest) -> Result<usize, MapGuardError> {
        if !request.is_anonymous() {
            if !self.policy().use_mapping_cache {
                return self.map(&request);
            }
            // Untracked, but it may have replaced tracked pages or their guards.
            let mut store = self.store.lock();
            let addr = self.map(&request)?;
            let end = addr.saturating_add(round_up(request.length, self.page_size()));
            self.carve(&mut store, addr, end, None);
            return Ok(addr);
        }

        let rights = AccessRights::from_prot(request.prot);
        self.policy
            .check_create(request.addr, rights)
            .map_err(|denial| self.deny("mmap", request.addr, request.length, rights, denial))?;

        let addr = if self.policy().use_mapping_cache {
            let mut store = self.store.lock();
            let addr = self.map(&request)?;
            self.track(&mut store, addr, request.length, rights);
            addr
        } else {
            self.map(&request)?
        };

        if self.policy.should_poison(rights) {
            self.primitives.fill(addr, request.length, POISON_BYTE);
        }
        Ok(addr)
    }

    unsafe fn map(&self, request: &MapRequest) -> Result<usize, MapGuardError> {
        self.primitives
            .map(
                request.addr,
                request.length,
                request.prot,
                request.flags,
                request.fd,
                request.offset,
            )
            .map_err(failed("mmap"))
    }

    unsafe fn track(&self, store: &mut MappingStore, addr: usize, length: usize, rights: AccessRights) {
        let end = addr + round_up(length, self.page_size());
        self.carve(store, addr, end, None);

        let mut record = MappingRecord::new(addr, length, rights);
        if self.policy().guard_pages_active() {
            self.guards().place_all(&mut record);
        }
        debug!(addr = format_args!("{addr:#x}"), length, prot = %rights, "tracking mapping");
        store.insert(record);
    }

    /// Removes a mapping, the `munmap` entry point.
    ///
    /// A tracked record is dropped, trimmed at either end or split in two depending
    /// on where `[addr, addr + length)` falls. The guards follow the new edges.
    ///
    /// # Safety
    ///
    /// Same contract as `munmap(2)`.
    pub unsafe fn remove(&self, addr: usize, length: usize) -> Result<(), MapGuardError> {
        if !self.policy().use_mapping_cache {
            return self.primitives.unmap(addr, length).map_err(failed("munmap"));
        }

        let mut store = self.store.lock();
        self.primitives.unmap(addr, length).map_err(failed("munmap"))?;

        let end = addr.saturating_add(round_up(length, self.page_size()));
        let covering = store.find_by_address(addr);
        self.carve(&mut store, addr, end, covering);
        if let Some(handle) = covering {
            self.cut(&mut store, handle, addr, end, self.policy().guard_pages_active());
        }
        Ok(())
    }

    /// Changes protection, the `mprotect` entry point.
    ///
    /// With the cache enabled the covering record's history feeds the transition
    /// rules, and a successful change is recorded against the whole record even when
    /// only part of it was reprotected.
    ///
    /// # Safety
    ///
    /// Same contract as `mprotect(2)`.
    pub unsafe fn reprotect(&self, addr: usize, length: usize, prot: i32) -> Result<(), MapGuardError> {
        let rights = AccessRights::from_prot(prot);
        if !self.policy().use_mapping_cache {
            self.policy
                .check_reprotect(rights, None)
                .map_err(|denial| self.deny("mprotect", addr, length, rights, denial))?;
            return self.primitives.protect(addr, length, prot).map_err(failed("mprotect"));
        }

        let mut store = self.store.lock();
        let handle = store.find_by_address(addr);
        let history = handle
            .and_then(|handle| store.get(handle))
            .map(MappingRecord::history);
        self.policy
            .check_reprotect(rights, history)
            .map_err(|denial| self.deny("mprotect", addr, length, rights, denial))?;

        self.primitives.protect(addr, length, prot).map_err(failed("mprotect"))?;

        let page_size = self.page_size();
        if let Some(record) = handle.and_then(|handle| store.get_mut(handle)) {
            if round_up(length, page_size) != record.span(page_size) {
                warn!(
                    addr = format_args!("{addr:#x}"),
                    length,
                    tracked = record.length,
                    "protection change covers part of a tracked mapping"
                );
            }
            record.record_protection(rights);
            debug!(
                addr = format_args!("{:#x}", record.base),
                prot = %rights,
                granted_ever = %record.granted_ever,
                "updated protection"
            );
        }
        Ok(())
    }

    /// Moves or resizes a mapping, the `mremap` entry point.
    ///
    /// Guards are lifted before the call so they cannot block growth in place, and
    /// are put back at the old edges if the call fails.
    ///
    /// # Safety
    ///
    /// Same contract as `mremap(2)`; `new_addr` is only read with `MREMAP_FIXED`.
    pub unsafe fn relocate(
        &self,
        old_addr: usize,
        old_length: usize,
        new_length: usize,
        flags: i32,
        new_addr: usize,
    ) -> Result<usize, MapGuardError> {
        if !self.policy().use_mapping_cache {
            return self
                .primitives
                .remap(old_addr, old_length, new_length, flags, new_addr)
                .map_err(failed("mremap"));
        }

        let page_size = self.page_size();
        let guards = self.guards();
        let mut store = self.store.lock();
        let handle = store.find_by_address(old_addr);

        let lifted = match handle.and_then(|handle| store.get_mut(handle)) {
            Some(record) => {
                let lifted = (record.guard_below.is_some(), record.guard_above.is_some());
                guards.remove_all(record);
                lifted
            }
            None => (false, false),
        };

        let moved = match self
            .primitives
            .remap(old_addr, old_length, new_length, flags, new_addr)
        {
            Ok(moved) => moved,
            Err(errno) => {
                if let Some(record) = handle.and_then(|handle| store.get_mut(handle)) {
                    if lifted.0 {
                        guards.place_below(record);
                    }
                    if lifted.1 {
                        guards.place_above(record);
                    }
                }
                return Err(MapGuardError::SyscallFailed { op: "mremap", errno });
            }
        };

        let end = moved.saturating_add(round_up(new_length, page_size));
        self.carve(&mut store, moved, end, handle);

        if let Some(record) = handle.and_then(|handle| store.get_mut(handle)) {
            if record.base != old_addr || record.span(page_size) != round_up(old_length, page_size)
            {
                warn!(
                    addr = format_args!("{old_addr:#x}"),
                    length = old_length,
                    tracked_base = format_args!("{:#x}", record.base),
                    tracked = record.length,
                    "remap covers part of a tracked mapping"
                );
            }
            guards.rehome(record, moved, new_length, self.policy().guard_pages_active());
            debug!(
                from = format_args!("{old_addr:#x}"),
                to = format_args!("{moved:#x}"),
                length = new_length,
                "relocated mapping"
            );
        }
        Ok(moved)
    }

    /// Releases every record and any isolation key still held. Guard pages and the
    /// tracked memory itself are left to the kernel.
    pub fn teardown(&self) {
        let mut store = self.store.lock();
        let released = store.len();
        let mut keys = BTreeSet::new();
        store.clear_with(|record| keys.extend(record.execute_only.and_then(|xom| xom.pkey)));
        for key in keys {
            self.primitives.pkey_free(key);
        }
        debug!(released, "mapping cache torn down");
    }

    /// Frees the isolation key of a record already taken out of `store`, unless a
    /// fragment split off the same mapping still holds it. The pages must be gone.
    pub(crate) fn release_key(&self, store: &MappingStore, record: &MappingRecord) {
        let Some(key) = record.execute_only.and_then(|xom| xom.pkey) else {
            return;
        };
        let shared = store
            .iter()
            .any(|(_, other)| other.execute_only.and_then(|xom| xom.pkey) == Some(key));
        if shared {
            debug!(key, "isolation key still held by another fragment");
        } else {
            self.primitives.pkey_free(key);
            debug!(key, "freed isolation key");
        }
    }

    /// Updates records overlapping `[start, end)`, which the kernel has just replaced
    /// or released. `keep` is left for the caller to handle.
    unsafe fn carve(&self, store: &mut MappingStore, start: usize, end: usize, keep: Option<Handle>) {
        for handle in store.guarded_within(start, end) {
            if let Some(record) = store.get_mut(handle) {
                forget_within(record, start, end);
            }
        }

        for handle in store.overlapping(start, end, self.page_size()) {
            if Some(handle) == keep {
                continue;
            }
            if let Some(record) = store.get(handle) {
                warn!(
                    addr = format_args!("{:#x}", record.base),
                    length = record.length,
                    "tracked mapping changed behind the cache"
                );
            }
            self.cut(store, handle, start, end, false);
        }
    }

    /// Takes the page-aligned range `[start, end)` out of a record.
    unsafe fn cut(
        &self,
        store: &mut MappingStore,
        handle: Handle,
        start: usize,
        end: usize,
        place_guards: bool,
    ) {
        let page_size = self.page_size();
        let guards = self.guards();
        let Some(record) = store.get_mut(handle) else {
            return;
        };
        let base = record.base;
        let limit = record.base + record.length;
        let record_end = record.end(page_size);
        forget_within(record, start, end);

        if start <= base && end >= record_end {
            if let Some(mut record) = store.remove(handle) {
                guards.remove_all(&mut record);
                self.release_key(store, &record);
                debug!(addr = format_args!("{base:#x}"), "untracked mapping");
            }
        } else if start <= base {
            guards.remove_below(record);
            record.base = end;
            record.length = limit - end;
            if place_guards {
                guards.place_below(record);
            }
            debug!(addr = format_args!("{end:#x}"), length = record.length, "trimmed mapping head");
        } else if end >= record_end {
            guards.remove_above(record);
            record.length = start - base;
            if place_guards {
                guards.place_above(record);
            }
            debug!(addr = format_args!("{base:#x}"), length = record.length, "trimmed mapping tail");
        } else {
            // Both fragments share an isolation key; it is freed with the last one.
            let mut upper = MappingRecord {
                base: end,
                length: limit - end,
                guard_below: None,
                guard_above: record.guard_above.take(),
                ..record.clone()
            };
            record.length = start - base;
            if place_guards && end - start >= 2 * page_size {
                guards.place_above(record);
                guards.place_below(&mut upper);
            }
            debug!(
                lower = format_args!("{base:#x}"),
                upper = format_args!("{end:#x}"),
                "split mapping"
            );
            store.insert(upper);
        }
    }
}
