//! Per-session tool grants and the capability flag.

use std::collections::BTreeSet;

use serde::Serialize;

/// Granted tool names plus the secondary flag for the high-risk capability.
///
/// Both start empty/off. Grants are by name only; whether a tool needs a grant
/// at all is decided by its descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PermissionSet {
    granted: BTreeSet<String>,
    capability_enabled: bool,
}

impl PermissionSet {
    /// Empty set, capability off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a tool. Returns `false` if it was already granted.
    pub fn grant(&mut self, tool: &str) -> bool {
        self.granted.insert(tool.to_string())
    }

    /// Revoke a tool. Returns `false` if it was not granted.
    pub fn revoke(&mut self, tool: &str) -> bool {
        self.granted.remove(tool)
    }

    /// Whether `tool` is granted.
    pub fn is_granted(&self, tool: &str) -> bool {
        self.granted.contains(tool)
    }

    /// Flip the capability flag.
    pub fn set_capability_enabled(&mut self, enabled: bool) {
        self.capability_enabled = enabled;
    }

    /// Whether the capability flag is on.
    pub fn is_capability_enabled(&self) -> bool {
        self.capability_enabled
    }

    /// Granted tool names in sorted order.
    pub fn granted(&self) -> impl Iterator<Item = &str> {
        self.granted.iter().map(String::as_str)
    }
}
