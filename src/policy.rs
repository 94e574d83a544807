//! Pure policy decisions.
//!
//! Nothing here touches the mapping store or the address space: every check looks
//! only at the request and at the history snapshot the caller hands in.

use std::fmt::Display;

use crate::AccessRights;

pub mod config;

use config::PolicyConfig;

/// The rule a request broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Write and execute requested together.
    WriteExecute,
    /// A caller-chosen mapping address.
    StaticAddress { addr: usize },
    /// Execute requested on memory that was writable at some point.
    TransitionToExecute,
    /// Write requested on memory that was executable at some point.
    TransitionFromExecute,
}

impl Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::WriteExecute => write!(f, "write+execute memory is disallowed"),
            Violation::StaticAddress { addr } => {
                write!(f, "mapping at static address {addr:#x} is disallowed")
            }
            Violation::TransitionToExecute => {
                write!(f, "memory that was writable cannot become executable")
            }
            Violation::TransitionFromExecute => {
                write!(f, "memory that was executable cannot become writable")
            }
        }
    }
}

/// A negative decision. `fatal` tells the outermost caller to terminate the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denial {
    pub violation: Violation,
    pub fatal: bool,
}

/// What the policy needs to know about an already tracked mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtectionHistory {
    /// Union of every protection ever requested for the mapping.
    pub granted_ever: AccessRights,
    /// Execute-only mappings are exempt from the transition rules.
    pub execute_only: bool,
}

/// Evaluates requests against an immutable [`PolicyConfig`].
#[derive(Debug, Clone, Copy)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        PolicyEngine { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    fn deny(&self, violation: Violation) -> Denial {
        Denial {
            violation,
            fatal: self.config.panic_on_violation,
        }
    }

    fn check_write_exec(&self, rights: AccessRights) -> Result<(), Denial> {
        if self.config.disallow_rwx && rights.is_write_exec() {
            return Err(self.deny(Violation::WriteExecute));
        }
        Ok(())
    }

    /// Vets a new anonymous mapping.
    /// # Arguments
    /// - `addr`: The address the caller asked for, `0` when the kernel may choose.
    /// - `rights`: The requested protection.
    pub fn check_create(&self, addr: usize, rights: AccessRights) -> Result<(), Denial> {
        self.check_write_exec(rights)?;
        if self.config.disallow_static_address && addr != 0 {
            return Err(self.deny(Violation::StaticAddress { addr }));
        }
        Ok(())
    }

    /// Vets a protection change.
    /// # Arguments
    /// - `rights`: The requested protection.
    /// - `history`: The tracked history of the target mapping, if it is tracked.
    pub fn check_reprotect(
        &self,
        rights: AccessRights,
        history: Option<ProtectionHistory>,
    ) -> Result<(), Denial> {
        self.check_write_exec(rights)?;

        let Some(history) = history.filter(|h| !h.execute_only) else {
            return Ok(());
        };
        if self.config.disallow_transition_to_x
            && rights.has(AccessRights::EXEC)
            && history.granted_ever.has(AccessRights::WRITE)
        {
            return Err(self.deny(Violation::TransitionToExecute));
        }
        if self.config.disallow_transition_from_x
            && rights.has(AccessRights::WRITE)
            && history.granted_ever.has(AccessRights::EXEC)
        {
            return Err(self.deny(Violation::TransitionFromExecute));
        }
        Ok(())
    }

    /// Whether a freshly created mapping must be overwritten with [`crate::POISON_BYTE`].
    pub fn should_poison(&self, rights: AccessRights) -> bool {
        self.config.poison_on_allocation && rights.has(AccessRights::WRITE)
    }
}
