//! Execute-only memory built from a caller-supplied buffer.
//!
//! The code is copied into a fresh writable mapping which is then demoted to
//! execute-only. Where the CPU has protection keys the pages are tagged with a key
//! whose data access is disabled, so even the owning thread cannot read them back.
//! Otherwise plain `PROT_EXEC` is used and readability is up to the hardware.

use tracing::debug;

use crate::store::ExecuteOnly;
use crate::{AccessRights, Interceptor, MapGuardError, MappingRecord, PkeyAccessRights, Primitives};

impl<P: Primitives> Interceptor<P> {
    /// Maps `size` bytes holding a copy of `code` and makes them execute-only.
    /// # Arguments
    /// - `size`: Length of the new mapping.
    /// - `code`: Bytes to place at its start; must be non-empty and fit in `size`.
    /// # Returns
    /// - `Ok(addr)`: Base of the tracked execute-only mapping.
    /// - `Err(MapGuardError)`: Nothing was left mapped and no key is held.
    pub fn make_execute_only(&self, size: usize, code: &[u8]) -> Result<usize, MapGuardError> {
        if !self.policy().use_mapping_cache {
            return Err(MapGuardError::CacheDisabled);
        }
        if code.is_empty() {
            return Err(MapGuardError::InvalidExtensionRequest("empty source"));
        }
        if code.len() > size {
            return Err(MapGuardError::InvalidExtensionRequest(
                "source is larger than the mapping",
            ));
        }

        let mut store = self.store.lock();
        let addr = unsafe {
            self.primitives.map(
                0,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .map_err(|errno| MapGuardError::SyscallFailed { op: "mmap", errno })?;

        let sealed = unsafe {
            self.primitives.copy_into(addr, code);
            self.seal(addr, size)
        };
        let pkey = match sealed {
            Ok(pkey) => pkey,
            Err(err) => {
                let _ = unsafe { self.primitives.unmap(addr, size) };
                return Err(err);
            }
        };

        let access_rights = pkey
            .and_then(|key| self.primitives.pkey_rights(key))
            .unwrap_or(PkeyAccessRights::DisableAccess);
        let mut record = MappingRecord::new(addr, size, AccessRights::EXEC);
        record.execute_only = Some(ExecuteOnly {
            pkey,
            access_rights,
        });
        if self.policy().guard_pages_active() {
            unsafe { self.guards().place_all(&mut record) };
        }
        debug!(
            addr = format_args!("{addr:#x}"),
            size,
            copied = code.len(),
            pkey,
            "created execute-only mapping"
        );
        store.insert(record);
        Ok(addr)
    }

    /// Drops `PROT_READ | PROT_WRITE` from a fresh mapping, returning the key that now
    /// guards it, if any.
    unsafe fn seal(&self, addr: usize, size: usize) -> Result<Option<u32>, MapGuardError> {
        match self.primitives.pkey_alloc(PkeyAccessRights::DisableAccess) {
            Ok(key) => match self.primitives.pkey_protect(addr, size, libc::PROT_EXEC, key) {
                Ok(()) => Ok(Some(key)),
                Err(errno) => {
                    self.primitives.pkey_free(key);
                    Err(MapGuardError::PkeyMprotectFailed(errno))
                }
            },
            // No keys on this machine, or none left.
            Err(libc::ENOSYS | libc::EINVAL | libc::ENOSPC) => self
                .primitives
                .protect(addr, size, libc::PROT_EXEC)
                .map(|()| None)
                .map_err(|errno| MapGuardError::SyscallFailed { op: "mprotect", errno }),
            Err(errno) => Err(MapGuardError::PkeyAllocFailed(errno)),
        }
    }

    /// Releases a mapping made by [`Interceptor::make_execute_only`]: forgets the
    /// record, unmaps the memory along with its guards, then frees its key unless a
    /// split-off fragment still holds it.
    ///
    /// # Safety
    ///
    /// No thread may still be executing from the mapping.
    pub unsafe fn release_execute_only(&self, addr: usize, length: usize) -> Result<(), MapGuardError> {
        if !self.policy().use_mapping_cache {
            return Err(MapGuardError::CacheDisabled);
        }

        let mut store = self.store.lock();
        let handle = store
            .find_by_address(addr)
            .ok_or(MapGuardError::NotTracked(addr))?;
        if store.get(handle).is_some_and(|record| record.execute_only.is_none()) {
            return Err(MapGuardError::InvalidExtensionRequest(
                "not an execute-only mapping",
            ));
        }
        let Some(mut record) = store.remove(handle) else {
            return Err(MapGuardError::NotTracked(addr));
        };

        self.guards().remove_all(&mut record);
        if length != record.length {
            debug!(
                addr = format_args!("{addr:#x}"),
                length,
                tracked = record.length,
                "releasing the whole execute-only mapping"
            );
        }
        let unmapped = self
            .primitives
            .unmap(record.base, record.length)
            .map_err(|errno| MapGuardError::SyscallFailed { op: "munmap", errno });
        // A key must not be recycled while pages tagged with it are still mapped.
        if unmapped.is_ok() {
            self.release_key(&store, &record);
        }
        unmapped
    }
}
