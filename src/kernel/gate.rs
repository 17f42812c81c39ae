//! The policy decision function.
//!
//! [`evaluate`] checks a proposal against the registry, the session's grants,
//! its replay mode and its budget, in a fixed order where the first failing
//! check wins. It has no I/O and never fails: every path ends in a
//! [`Decision`]. An allow carries the budget reservation it made so the caller
//! can roll it back if the ledger append fails.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::budget::{BudgetTracker, Reservation};
use super::permissions::PermissionSet;
use super::replay::{fingerprint, ReplayMode, ReplayStore};
use crate::canonical;
use crate::tools::{schema, ToolRegistry};

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Binary gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The action may proceed.
    Allow,
    /// The action is refused.
    Deny,
}

impl Outcome {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }

    /// Parse a wire label.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

/// Why a proposal was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The tool name is not registered.
    UnknownTool,
    /// The tool needs a grant the session has not given.
    NotGranted,
    /// The tool is the high-risk capability and the session flag is off.
    CapabilityDisabled,
    /// The session replays and the tool is never replayable.
    ReplayDenied,
    /// The arguments do not fit the tool's schema.
    MalformedArguments,
    /// The session replays and no record matches the fingerprint.
    ReplayMiss,
    /// The per-turn call or byte budget would be exceeded.
    BudgetExceeded,
}

impl DenyReason {
    /// Stable reason code.
    pub fn code(self) -> &'static str {
        match self {
            Self::UnknownTool => "unknown_tool",
            Self::NotGranted => "not_granted",
            Self::CapabilityDisabled => "capability_disabled",
            Self::ReplayDenied => "replay_denied",
            Self::MalformedArguments => "malformed_arguments",
            Self::ReplayMiss => "replay_miss",
            Self::BudgetExceeded => "budget_exceeded",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Result of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Allow or deny.
    pub outcome: Outcome,
    /// Set exactly when `outcome` is [`Outcome::Deny`].
    pub reason: Option<DenyReason>,
    /// Human-readable context for a denial.
    pub detail: Option<String>,
    /// RFC 3339 decision time.
    pub ts_utc: String,
    /// Budget charged by an allow.
    #[serde(skip)]
    pub reservation: Option<Reservation>,
}

impl Decision {
    fn allow(reservation: Reservation) -> Self {
        Self {
            outcome: Outcome::Allow,
            reason: None,
            detail: None,
            ts_utc: now_utc(),
            reservation: Some(reservation),
        }
    }

    /// A denial with a reason and optional detail.
    pub fn deny(reason: DenyReason, detail: Option<String>) -> Self {
        Self {
            outcome: Outcome::Deny,
            reason: Some(reason),
            detail,
            ts_utc: now_utc(),
            reservation: None,
        }
    }

    /// Whether the decision is an allow.
    pub fn is_allow(&self) -> bool {
        self.outcome == Outcome::Allow
    }
}

/// Current UTC time, RFC 3339 with microseconds and a `Z` suffix.
pub fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

// ---------------------------------------------------------------------------
// Proposed action
// ---------------------------------------------------------------------------

/// A candidate tool call from the untrusted layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    /// Tool name.
    pub tool: String,
    /// Tool arguments, expected to be a JSON object.
    #[serde(default = "empty_object")]
    pub arguments: Value,
    /// Optional free-form kind tag from the proposer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Optional risk tags from the proposer. Informational only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_tags: Vec<String>,
    /// Expected bytes the call will move. Defaults to the canonical argument size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_estimate: Option<u64>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl ProposedAction {
    /// Proposal with no tags and no explicit byte estimate.
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            arguments,
            kind: None,
            risk_tags: Vec::new(),
            byte_estimate: None,
        }
    }

    /// Set an explicit byte estimate.
    #[must_use]
    pub fn with_byte_estimate(mut self, bytes: u64) -> Self {
        self.byte_estimate = Some(bytes);
        self
    }

    /// Set the kind tag.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Replay fingerprint of `(tool, arguments)`.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.tool, &self.arguments)
    }

    /// Bytes to reserve: the explicit estimate, else the canonical argument length.
    pub fn estimated_bytes(&self) -> u64 {
        self.byte_estimate.unwrap_or_else(|| {
            u64::try_from(canonical::encode(&self.arguments).len()).unwrap_or(u64::MAX)
        })
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Whether a replay record exists for a fingerprint.
pub trait ReplayLookup {
    /// `true` when a record with this fingerprint is stored.
    fn contains(&self, fingerprint: &str) -> bool;
}

impl ReplayLookup for ReplayStore {
    fn contains(&self, fingerprint: &str) -> bool {
        ReplayStore::contains(self, fingerprint)
    }
}

impl ReplayLookup for HashSet<String> {
    fn contains(&self, fingerprint: &str) -> bool {
        HashSet::contains(self, fingerprint)
    }
}

/// Session state the gate reads. Only the budget is mutated, and only on allow.
pub struct GateContext<'a> {
    /// Process-wide tool registry.
    pub registry: &'a ToolRegistry,
    /// Session grants and capability flag.
    pub permissions: &'a PermissionSet,
    /// Session budget.
    pub budget: &'a mut BudgetTracker,
    /// Session replay mode.
    pub replay_mode: ReplayMode,
    /// Session replay records.
    pub replay: &'a dyn ReplayLookup,
}

/// Decide a proposal. First failing check wins:
///
/// 1. unknown tool
/// 2. grant required but missing
/// 3. capability tool with the flag off
/// 4. replay mode and the tool is never replayable
/// 5. arguments do not fit the schema
/// 6. replay mode and no cached record
/// 7. budget reservation fails
///
/// Otherwise allow, with the reservation committed.
pub fn evaluate(ctx: GateContext<'_>, action: &ProposedAction) -> Decision {
    let Some(desc) = ctx.registry.get(&action.tool) else {
        return Decision::deny(
            DenyReason::UnknownTool,
            Some(format!("tool '{}' is not registered", action.tool)),
        );
    };

    if desc.require_grant && !ctx.permissions.is_granted(&desc.name) {
        return Decision::deny(
            DenyReason::NotGranted,
            Some(format!("tool '{}' requires a grant", desc.name)),
        );
    }

    if ctx.registry.is_capability(&desc.name) && !ctx.permissions.is_capability_enabled() {
        return Decision::deny(
            DenyReason::CapabilityDisabled,
            Some(format!("capability '{}' is disabled", desc.name)),
        );
    }

    let replaying = ctx.replay_mode == ReplayMode::Replay;
    if replaying && desc.deny_in_replay {
        return Decision::deny(
            DenyReason::ReplayDenied,
            Some(format!("tool '{}' cannot run in replay mode", desc.name)),
        );
    }

    if let Err(violation) = schema::validate(&desc.schema, &action.arguments) {
        return Decision::deny(DenyReason::MalformedArguments, Some(violation.to_string()));
    }

    if replaying {
        let fp = action.fingerprint();
        if !ctx.replay.contains(&fp) {
            return Decision::deny(
                DenyReason::ReplayMiss,
                Some(format!("no replay record for fingerprint {fp}")),
            );
        }
    }

    match ctx
        .budget
        .check_and_reserve(&desc.name, &desc.limits, action.estimated_bytes())
    {
        Ok(reservation) => Decision::allow(reservation),
        Err(exceeded) => Decision::deny(DenyReason::BudgetExceeded, Some(exceeded.to_string())),
    }
}
