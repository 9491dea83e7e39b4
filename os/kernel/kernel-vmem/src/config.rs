//! Tunables for page-table storage.

/// Default number of node ids in a pool arena.
///
/// With 2 KiB nodes this covers 32 MiB of segment tables.
#[cfg(not(debug_assertions))]
pub const DEFAULT_NODE_CAPACITY: usize = 16 * 1024;

/// Default number of node ids in a pool arena (debug builds).
#[cfg(debug_assertions)]
pub const DEFAULT_NODE_CAPACITY: usize = 4 * 1024;

const _: () = assert!(DEFAULT_NODE_CAPACITY < 1 << 31);

/// How teardown treats leaves that still hold valid entries.
///
/// The tree cannot tell whether a caller forgot to unmap something or
/// intentionally left entries behind, so the reaction is configurable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LiveEntryCheck {
    /// Free leaves without inspecting them.
    Trust,
    /// Log a warning per offending leaf and free it anyway.
    Warn,
    /// Treat leftover entries as a fatal bug.
    Deny,
}

impl LiveEntryCheck {
    /// [`Deny`](Self::Deny) in debug builds, [`Warn`](Self::Warn) otherwise.
    pub const DEFAULT: Self = if cfg!(debug_assertions) {
        Self::Deny
    } else {
        Self::Warn
    };
}

impl Default for LiveEntryCheck {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Configuration shared by the node pool and address spaces.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PmapConfig {
    /// Arena size of the node pool.
    pub node_capacity: usize,
    /// Teardown policy for leftover valid entries.
    pub live_entry_check: LiveEntryCheck,
}

impl PmapConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            node_capacity: DEFAULT_NODE_CAPACITY,
            live_entry_check: LiveEntryCheck::DEFAULT,
        }
    }

    #[must_use]
    pub const fn with_node_capacity(mut self, node_capacity: usize) -> Self {
        self.node_capacity = node_capacity;
        self
    }

    #[must_use]
    pub const fn with_live_entry_check(mut self, check: LiveEntryCheck) -> Self {
        self.live_entry_check = check;
        self
    }
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self::new()
    }
}
