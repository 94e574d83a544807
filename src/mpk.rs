use std::fmt::Display;

#[cfg(target_arch = "x86_64")]
mod pkru;

use crate::{AccessRights, Errno};

/// Access rights for a protection key.
///
/// The rights are enforced per thread by the CPU's Protection Key Rights for User
/// pages (PKRU) register, on top of the page-level protection.
///
/// # Variants
///
/// - `EnableAccessWrite`: Both read and write access are enabled (bits: 00).
/// - `DisableAccess`: Both read and write access are disabled (bits: 01).
/// - `DisableWrite`: Write access is disabled, but read access is enabled (bits: 10).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum PkeyAccessRights {
    EnableAccessWrite = 0x0,
    DisableAccess = 0x1,
    DisableWrite = 0x2,
}

impl PkeyAccessRights {
    /// Decodes the two PKRU bits of one key.
    pub fn from_pkru_bits(bits: u32) -> Self {
        match bits & 0b11 {
            0b00 => PkeyAccessRights::EnableAccessWrite,
            0b10 => PkeyAccessRights::DisableWrite,
            _ => PkeyAccessRights::DisableAccess,
        }
    }
}

impl Display for PkeyAccessRights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PkeyAccessRights::EnableAccessWrite => write!(f, "Enable Access and Write"),
            PkeyAccessRights::DisableAccess => write!(f, "Disable Access"),
            PkeyAccessRights::DisableWrite => write!(f, "Disable Write"),
        }
    }
}

/// A protection key (pkey) allocated from the kernel.
///
/// Protection keys are a limited resource (15 usable keys on x86-64). The key is
/// freed when the `ProtectionKey` is dropped, unless ownership was handed off with
/// [`ProtectionKey::into_raw`]; execute-only mapping records hold their key that way
/// and give it back through [`ProtectionKey::from_raw`] when they are released.
#[derive(Debug)]
pub struct ProtectionKey {
    key: u32,
}

impl ProtectionKey {
    /// Allocates a new protection key with the specified initial access rights.
    ///
    /// # Arguments
    ///
    /// - `access`: The initial rights, applied to the calling thread's PKRU.
    ///
    /// # Returns
    ///
    /// - `Ok(ProtectionKey)`: A new key.
    /// - `Err(errno)`: `ENOSYS`/`EINVAL` when the system has no protection keys,
    ///   `ENOSPC` when all keys are taken.
    pub fn new(access: PkeyAccessRights) -> Result<Self, Errno> {
        let key = unsafe {
            libc::syscall(
                libc::SYS_pkey_alloc,
                0,                  // Flags. Reserved, must be 0.
                access as i32,      // Initial access rights
            )
        };

        if key < 0 {
            Err(last_errno())
        } else {
            Ok(ProtectionKey { key: key as u32 })
        }
    }

    /// Takes ownership of a key previously released with [`ProtectionKey::into_raw`].
    ///
    /// # Safety
    ///
    /// `key` must be an allocated key that nothing else will free.
    pub unsafe fn from_raw(key: u32) -> Self {
        ProtectionKey { key }
    }

    /// Gives up ownership without freeing the key.
    pub fn into_raw(self) -> u32 {
        let key = self.key;
        std::mem::forget(self);
        key
    }

    /// Returns the protection key ID.
    pub fn key(&self) -> u32 {
        self.key
    }

    /// Reads the calling thread's current rights for this key from the PKRU register.
    ///
    /// Returns `None` on architectures without PKRU.
    pub fn access_rights(&self) -> Option<PkeyAccessRights> {
        #[cfg(target_arch = "x86_64")]
        {
            // The key exists, so the CPU supports RDPKRU.
            Some(PkeyAccessRights::from_pkru_bits(unsafe { pkru::key_bits(self.key) }))
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            None
        }
    }

    /// Sets the page protection of `[addr, addr + len)` and tags it with this key.
    ///
    /// # Safety
    ///
    /// The range must be mapped and must not back memory the caller still
    /// relies on being accessible.
    pub unsafe fn protect(&self, addr: usize, len: usize, access_rights: AccessRights) -> Result<(), Errno> {
        let ret = libc::syscall(
            libc::SYS_pkey_mprotect,
            addr,
            len,
            access_rights.to_i32(),
            self.key,
        );

        if ret != 0 {
            return Err(last_errno());
        }
        Ok(())
    }
}

impl Drop for ProtectionKey {
    /// Frees the key with `pkey_free`. A failure cannot be reported from a destructor
    /// and only happens for keys that were never allocated, so it is ignored.
    fn drop(&mut self) {
        unsafe {
            libc::syscall(
                libc::SYS_pkey_free,
                self.key,           // The protection key to be freed
            );
        }
    }
}

pub(crate) fn last_errno() -> Errno {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EINVAL)
}
