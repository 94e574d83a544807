use bitflags::bitflags;

bitflags! {
    /// Page protection bits as passed to `mmap`, `mprotect` and friends.
    /// - `NONE`: No access.
    /// - `READ`: Read access.
    /// - `WRITE`: Write access.
    /// - `EXEC`: Execute access.
    /// - `READ_WRITE`, `READ_EXEC`, `WRITE_EXEC`, `READ_WRITE_EXEC`: the usual combinations.
    ///
    /// Bits the kernel understands but this crate does not name (e.g. `PROT_GROWSDOWN`)
    /// are retained, so a value round-trips unchanged to the real primitive.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccessRights: i32 {
        const NONE = libc::PROT_NONE;
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
        const READ_WRITE = libc::PROT_READ | libc::PROT_WRITE;
        const READ_EXEC = libc::PROT_READ | libc::PROT_EXEC;
        const WRITE_EXEC = libc::PROT_WRITE | libc::PROT_EXEC;
        const READ_WRITE_EXEC = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
    }
}

impl AccessRights {
    /// Interprets a raw `prot` argument.
    /// # Arguments
    /// - `prot`: The protection value handed to the intercepted call.
    /// # Returns
    /// - The access rights, with unknown bits kept as-is.
    pub fn from_prot(prot: i32) -> AccessRights {
        AccessRights::from_bits_retain(prot)
    }

    /// Add the specified access rights to the current access rights.
    /// # Arguments
    /// - `right`: The access rights to add.
    /// # Returns
    /// - The union of both sets.
    pub fn add(&self, right: AccessRights) -> AccessRights {
        AccessRights::from_bits_retain(self.bits() | right.bits())
    }

    /// Checks if the current access rights contain every bit of `right`.
    /// # Arguments
    /// - `right`: The access rights to check for.
    /// # Returns
    /// - `true`: If all bits of `right` are present.
    /// - `false`: Otherwise.
    pub fn has(&self, right: AccessRights) -> bool {
        self.bits() & right.bits() == right.bits()
    }

    /// Whether these rights make memory writable and executable at the same time.
    pub fn is_write_exec(&self) -> bool {
        self.has(AccessRights::WRITE_EXEC)
    }

    /// Convert the access rights to the raw `prot` representation.
    pub fn to_i32(&self) -> i32 {
        self.bits()
    }
}

impl std::fmt::Display for AccessRights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flag = |right, c| if self.has(right) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(AccessRights::READ, 'r'),
            flag(AccessRights::WRITE, 'w'),
            flag(AccessRights::EXEC, 'x')
        )
    }
}
