//! The real virtual-memory primitives the interception layer delegates to.

use crate::{Errno, PkeyAccessRights};

pub mod linux;

/// Platform interface to the underlying mapping calls.
///
/// Implementations must not route back through the interposed libc symbols.
/// Every method mirrors its C counterpart, with failures reported as the raw errno.
///
/// # Safety
///
/// The methods operate on raw address ranges; callers must uphold the same
/// contracts as for the corresponding system calls.
pub trait Primitives: Send + Sync {
    fn page_size(&self) -> usize;

    unsafe fn map(
        &self,
        addr: usize,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> Result<usize, Errno>;

    unsafe fn unmap(&self, addr: usize, length: usize) -> Result<(), Errno>;

    unsafe fn protect(&self, addr: usize, length: usize, prot: i32) -> Result<(), Errno>;

    unsafe fn remap(
        &self,
        old_addr: usize,
        old_length: usize,
        new_length: usize,
        flags: i32,
        new_addr: usize,
    ) -> Result<usize, Errno>;

    /// Overwrites `length` bytes at `addr` with `byte`. The range must be writable.
    unsafe fn fill(&self, addr: usize, length: usize, byte: u8);

    /// Copies `bytes` to `addr`. The range must be writable.
    unsafe fn copy_into(&self, addr: usize, bytes: &[u8]);

    fn pkey_alloc(&self, _rights: PkeyAccessRights) -> Result<u32, Errno> {
        Err(libc::ENOSYS)
    }

    unsafe fn pkey_protect(
        &self,
        _addr: usize,
        _length: usize,
        _prot: i32,
        _key: u32,
    ) -> Result<(), Errno> {
        Err(libc::ENOSYS)
    }

    /// Current rights of `key` for the calling thread, when the platform can tell.
    fn pkey_rights(&self, _key: u32) -> Option<PkeyAccessRights> {
        None
    }

    fn pkey_free(&self, _key: u32) {}
}
