//! Runtime memory-protection policy enforcement.
//!
//! `mapguard` sits in front of a process's virtual-memory primitives (`mmap`,
//! `munmap`, `mprotect`, `mremap`) and vetoes requests that make exploitation
//! easier: writable+executable memory, write/execute transitions, caller-chosen
//! addresses. It optionally tracks every anonymous mapping, keeps inaccessible
//! guard pages around each one and poisons fresh writable memory.
//!
//! The engine itself is [`Interceptor`]; it is generic over [`Primitives`] so the
//! same code runs over the raw Linux syscalls ([`Syscalls`]) or an emulated
//! address space in tests. The `mapguard-preload` crate turns it into an
//! `LD_PRELOAD` shim.

use thiserror::Error;

pub mod access_rights;
pub mod guard;
pub mod intercept;
pub mod mpk;
pub mod policy;
pub mod primitives;
pub mod store;
pub mod xom;

#[cfg(test)]
mod test_utils;

pub use access_rights::AccessRights;
pub use intercept::{Interceptor, MapRequest};
pub use mpk::{PkeyAccessRights, ProtectionKey};
pub use policy::{config::PolicyConfig, Denial, PolicyEngine, ProtectionHistory, Violation};
pub use primitives::{linux::Syscalls, Primitives};
pub use store::{Handle, MappingRecord, MappingStore};

pub type Errno = i32;

/// Byte written over fresh writable mappings when poisoning is enabled.
pub const POISON_BYTE: u8 = 0xde;

/// Errors surfaced by the interception layer and the execute-only extension.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapGuardError {
    /// The request conflicts with an enabled rule.
    #[error("policy violation: {violation}")]
    PolicyViolation { violation: Violation, fatal: bool },
    /// The real primitive failed on its own.
    #[error("{op} failed with errno {errno}")]
    SyscallFailed { op: &'static str, errno: Errno },
    #[error("invalid execute-only request: {0}")]
    InvalidExtensionRequest(&'static str),
    #[error("the mapping cache is disabled")]
    CacheDisabled,
    #[error("no tracked mapping covers {0:#x}")]
    NotTracked(usize),
    #[error("pkey_alloc failed with errno {0}")]
    PkeyAllocFailed(Errno),
    #[error("pkey_mprotect failed with errno {0}")]
    PkeyMprotectFailed(Errno),
}

impl MapGuardError {
    /// The `errno` an unmodified C caller should observe for this error.
    pub fn errno(&self) -> Errno {
        match self {
            MapGuardError::SyscallFailed { errno, .. } => *errno,
            MapGuardError::PkeyAllocFailed(errno) | MapGuardError::PkeyMprotectFailed(errno) => {
                *errno
            }
            MapGuardError::PolicyViolation { .. }
            | MapGuardError::InvalidExtensionRequest(_)
            | MapGuardError::CacheDisabled
            | MapGuardError::NotTracked(_) => libc::EINVAL,
        }
    }

    /// Whether the caller is required to terminate the process after reporting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MapGuardError::PolicyViolation { fatal: true, .. })
    }
}

impl From<Denial> for MapGuardError {
    fn from(denial: Denial) -> Self {
        MapGuardError::PolicyViolation {
            violation: denial.violation,
            fatal: denial.fatal,
        }
    }
}

/// Rounds `n` up to a multiple of `page_size`.
pub(crate) fn round_up(n: usize, page_size: usize) -> usize {
    n.div_ceil(page_size) * page_size
}

/// Rounds `addr` down to the start of its page.
pub(crate) fn page_floor(addr: usize, page_size: usize) -> usize {
    addr & !(page_size - 1)
}
