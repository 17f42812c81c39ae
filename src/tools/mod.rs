//! Static tool catalogue consulted by the gate.
//!
//! The kernel never executes tools. It only needs to know, per tool name, how
//! risky the tool is, whether it needs a grant, whether it may run in replay
//! mode, its per-turn budget and the shape of its arguments.

pub mod registry;
pub mod schema;

use serde::{Deserialize, Serialize};

pub use registry::{ToolRegistry, CAPABILITY_TOOL};
pub use schema::{ArgField, ArgKind, SchemaViolation};

/// Risk level of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    /// Read-only or purely informational.
    Low,
    /// Writes to kernel-adjacent state or reaches the network.
    Medium,
    /// Mutates the host or runs arbitrary code.
    High,
}

impl Risk {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Coarse grouping of tools, reported with each descriptor in the tool listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolFamily {
    /// Local file reads and writes.
    Filesystem,
    /// Key/value memory store.
    Memory,
    /// Outbound HTTP.
    Network,
    /// Containerized execution.
    Sandbox,
    /// Source inspection and patching.
    Code,
    /// Side-effect free reasoning aids.
    Reasoning,
    /// Host shell and interpreter.
    Shell,
}

/// Per-turn budget of one tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimits {
    /// Maximum allowed calls per turn.
    pub calls_per_turn: u32,
    /// Maximum bytes per turn, `None` when unbounded.
    pub bytes_per_turn: Option<u64>,
}

impl BudgetLimits {
    /// Limits with a call cap and no byte cap.
    pub fn calls(calls_per_turn: u32) -> Self {
        Self {
            calls_per_turn,
            bytes_per_turn: None,
        }
    }

    /// Limits with both caps.
    pub fn calls_and_bytes(calls_per_turn: u32, bytes_per_turn: u64) -> Self {
        Self {
            calls_per_turn,
            bytes_per_turn: Some(bytes_per_turn),
        }
    }
}

/// Immutable description of one tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// Tool family.
    pub family: ToolFamily,
    /// Risk level.
    pub risk: Risk,
    /// Whether the session must explicitly grant the tool.
    pub require_grant: bool,
    /// Whether the tool is always refused while the session replays.
    pub deny_in_replay: bool,
    /// Per-turn budget.
    pub limits: BudgetLimits,
    /// Accepted argument fields.
    pub schema: Vec<ArgField>,
}

impl ToolDescriptor {
    /// Descriptor with no grant requirement, replay allowed and no arguments.
    pub fn new(name: impl Into<String>, family: ToolFamily, risk: Risk, limits: BudgetLimits) -> Self {
        Self {
            name: name.into(),
            family,
            risk,
            require_grant: false,
            deny_in_replay: false,
            limits,
            schema: Vec::new(),
        }
    }

    /// Require an explicit grant.
    #[must_use]
    pub fn requires_grant(mut self) -> Self {
        self.require_grant = true;
        self
    }

    /// Refuse the tool in replay mode.
    #[must_use]
    pub fn denied_in_replay(mut self) -> Self {
        self.deny_in_replay = true;
        self
    }

    /// Set the argument schema.
    #[must_use]
    pub fn with_schema(mut self, schema: Vec<ArgField>) -> Self {
        self.schema = schema;
        self
    }
}
