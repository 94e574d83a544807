//! Process-wide policy switches.

/// Disallows mappings that are writable and executable at once.
pub const MG_DISALLOW_RWX: &str = "MG_DISALLOW_RWX";
/// Disallows memory that was ever writable from becoming executable.
pub const MG_DISALLOW_TRANSITION_TO_X: &str = "MG_DISALLOW_TRANSITION_TO_X";
/// Disallows memory that was ever executable from becoming writable.
pub const MG_DISALLOW_TRANSITION_FROM_X: &str = "MG_DISALLOW_TRANSITION_FROM_X";
/// Disallows caller-chosen mapping addresses.
pub const MG_DISALLOW_STATIC_ADDRESS: &str = "MG_DISALLOW_STATIC_ADDRESS";
/// Places an inaccessible page below and above every tracked mapping.
pub const MG_ENABLE_GUARD_PAGES: &str = "MG_ENABLE_GUARD_PAGES";
/// Aborts the process on any denied operation.
pub const MG_PANIC_ON_VIOLATION: &str = "MG_PANIC_ON_VIOLATION";
/// Fills new writable mappings with [`crate::POISON_BYTE`].
pub const MG_POISON_ON_ALLOCATION: &str = "MG_POISON_ON_ALLOCATION";
/// Enables mapping tracking; guard pages and execute-only memory need it.
pub const MG_USE_MAPPING_CACHE: &str = "MG_USE_MAPPING_CACHE";
/// Emits telemetry for denials and cache events.
pub const MG_ENABLE_TELEMETRY: &str = "MG_ENABLE_TELEMETRY";
/// Older name of [`MG_ENABLE_TELEMETRY`].
pub const MG_ENABLE_SYSLOG: &str = "MG_ENABLE_SYSLOG";

/// Immutable set of enforcement switches. Every switch defaults to off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    pub disallow_rwx: bool,
    pub disallow_transition_to_x: bool,
    pub disallow_transition_from_x: bool,
    pub disallow_static_address: bool,
    pub enable_guard_pages: bool,
    pub panic_on_violation: bool,
    pub poison_on_allocation: bool,
    pub use_mapping_cache: bool,
    pub enable_telemetry: bool,
}

impl PolicyConfig {
    /// Reads every switch from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from an arbitrary variable lookup.
    /// # Arguments
    /// - `lookup`: Returns the value of the named variable, if set.
    /// # Returns
    /// - A configuration where a switch is on iff its variable parses to a non-zero number.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let on = |name: &str| lookup(name).is_some_and(|value| parse_switch(&value));
        PolicyConfig {
            disallow_rwx: on(MG_DISALLOW_RWX),
            disallow_transition_to_x: on(MG_DISALLOW_TRANSITION_TO_X),
            disallow_transition_from_x: on(MG_DISALLOW_TRANSITION_FROM_X),
            disallow_static_address: on(MG_DISALLOW_STATIC_ADDRESS),
            enable_guard_pages: on(MG_ENABLE_GUARD_PAGES),
            panic_on_violation: on(MG_PANIC_ON_VIOLATION),
            poison_on_allocation: on(MG_POISON_ON_ALLOCATION),
            use_mapping_cache: on(MG_USE_MAPPING_CACHE),
            enable_telemetry: on(MG_ENABLE_TELEMETRY) || on(MG_ENABLE_SYSLOG),
        }
    }

    pub fn with_disallow_rwx(mut self, on: bool) -> Self {
        self.disallow_rwx = on;
        self
    }

    pub fn with_disallow_transition_to_x(mut self, on: bool) -> Self {
        self.disallow_transition_to_x = on;
        self
    }

    pub fn with_disallow_transition_from_x(mut self, on: bool) -> Self {
        self.disallow_transition_from_x = on;
        self
    }

    pub fn with_disallow_static_address(mut self, on: bool) -> Self {
        self.disallow_static_address = on;
        self
    }

    pub fn with_guard_pages(mut self, on: bool) -> Self {
        self.enable_guard_pages = on;
        self
    }

    pub fn with_panic_on_violation(mut self, on: bool) -> Self {
        self.panic_on_violation = on;
        self
    }

    pub fn with_poison_on_allocation(mut self, on: bool) -> Self {
        self.poison_on_allocation = on;
        self
    }

    pub fn with_mapping_cache(mut self, on: bool) -> Self {
        self.use_mapping_cache = on;
        self
    }

    pub fn with_telemetry(mut self, on: bool) -> Self {
        self.enable_telemetry = on;
        self
    }

    /// Guard pages hang off cache records, so they only take effect with the cache.
    pub fn guard_pages_active(&self) -> bool {
        self.enable_guard_pages && self.use_mapping_cache
    }

    /// Describes switch combinations that cannot take effect as configured.
    pub fn warnings(&self) -> Vec<&'static str> {
        let mut warnings = Vec::new();
        if self.enable_guard_pages && !self.use_mapping_cache {
            warnings.push("MG_ENABLE_GUARD_PAGES has no effect without MG_USE_MAPPING_CACHE");
        }
        if (self.disallow_transition_to_x || self.disallow_transition_from_x)
            && !self.use_mapping_cache
        {
            warnings.push("transition rules need MG_USE_MAPPING_CACHE to see mapping history");
        }
        warnings
    }
}

/// Parses a switch value the way `strtoul(value, NULL, 0)` would and tests it for non-zero.
fn parse_switch(value: &str) -> bool {
    let value = value.trim_start();
    let value = value
        .strip_prefix(|c: char| c == '+' || c == '-')
        .unwrap_or(value);

    let (digits, radix) = if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_hexdigit()))
    {
        (hex, 16)
    } else if value.len() > 1 && value.starts_with('0') {
        (&value[1..], 8)
    } else {
        (value, 10)
    };

    digits
        .chars()
        .take_while(|c| c.is_digit(radix))
        .any(|c| c != '0')
}
