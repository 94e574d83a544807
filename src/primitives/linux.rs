use super::*;
use crate::mpk::{last_errno, ProtectionKey};
use crate::AccessRights;

/// The Linux system calls, issued directly so that an interposed `mmap` symbol is
/// never re-entered.
#[derive(Debug, Clone, Copy)]
pub struct Syscalls {
    page_size: usize,
}

impl Syscalls {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Syscalls {
            page_size: if page_size > 0 { page_size as usize } else { 4096 },
        }
    }
}

impl Default for Syscalls {
    fn default() -> Self {
        Self::new()
    }
}

fn check(ret: libc::c_long) -> Result<libc::c_long, Errno> {
    if ret == -1 {
        Err(last_errno())
    } else {
        Ok(ret)
    }
}

impl Primitives for Syscalls {
    fn page_size(&self) -> usize {
        self.page_size
    }

    unsafe fn map(
        &self,
        addr: usize,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> Result<usize, Errno> {
        let ret = libc::syscall(libc::SYS_mmap, addr, length, prot, flags, fd, offset);
        check(ret).map(|ptr| ptr as usize)
    }

    unsafe fn unmap(&self, addr: usize, length: usize) -> Result<(), Errno> {
        check(libc::syscall(libc::SYS_munmap, addr, length)).map(drop)
    }

    unsafe fn protect(&self, addr: usize, length: usize, prot: i32) -> Result<(), Errno> {
        check(libc::syscall(libc::SYS_mprotect, addr, length, prot)).map(drop)
    }

    unsafe fn remap(
        &self,
        old_addr: usize,
        old_length: usize,
        new_length: usize,
        flags: i32,
        new_addr: usize,
    ) -> Result<usize, Errno> {
        let ret = libc::syscall(
            libc::SYS_mremap,
            old_addr,
            old_length,
            new_length,
            flags,
            new_addr,
        );
        check(ret).map(|ptr| ptr as usize)
    }

    unsafe fn fill(&self, addr: usize, length: usize, byte: u8) {
        std::ptr::write_bytes(addr as *mut u8, byte, length);
    }

    unsafe fn copy_into(&self, addr: usize, bytes: &[u8]) {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    }

    fn pkey_alloc(&self, rights: PkeyAccessRights) -> Result<u32, Errno> {
        ProtectionKey::new(rights).map(ProtectionKey::into_raw)
    }

    unsafe fn pkey_protect(
        &self,
        addr: usize,
        length: usize,
        prot: i32,
        key: u32,
    ) -> Result<(), Errno> {
        let pkey = ProtectionKey::from_raw(key);
        let ret = pkey.protect(addr, length, AccessRights::from_prot(prot));
        pkey.into_raw();
        ret
    }

    fn pkey_rights(&self, key: u32) -> Option<PkeyAccessRights> {
        let pkey = unsafe { ProtectionKey::from_raw(key) };
        let rights = pkey.access_rights();
        pkey.into_raw();
        rights
    }

    fn pkey_free(&self, key: u32) {
        drop(unsafe { ProtectionKey::from_raw(key) });
    }
}
