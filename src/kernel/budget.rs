//! Per-turn call and byte budgets.
//!
//! Counters are keyed by tool and reset together at each turn boundary. A
//! reservation is all-or-nothing: when either limit would be exceeded nothing
//! changes. Synchronization is the caller's job; the session lock already
//! serializes every mutation.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::tools::BudgetLimits;

/// Why a reservation was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetExceeded {
    /// One more call would pass `calls_per_turn`.
    #[error("tool call limit exceeded for {tool}: {used} of {limit} calls used this turn")]
    Calls {
        /// Tool name.
        tool: String,
        /// Calls already charged this turn.
        used: u32,
        /// Per-turn limit.
        limit: u32,
    },

    /// The estimate would pass `bytes_per_turn`.
    #[error("byte limit exceeded for {tool}: {used} used + {requested} requested > {limit}")]
    Bytes {
        /// Tool name.
        tool: String,
        /// Bytes already charged this turn.
        used: u64,
        /// Bytes this call asked for.
        requested: u64,
        /// Per-turn limit.
        limit: u64,
    },
}

/// What a successful reservation charged, so it can be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Reservation {
    /// Turn the charge belongs to.
    pub turn: u64,
    /// Bytes charged.
    pub bytes: u64,
}

/// Serializable view of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    /// Calls charged this turn, per tool.
    pub calls: BTreeMap<String, u32>,
    /// Bytes charged this turn, per tool.
    pub bytes: BTreeMap<String, u64>,
    /// Current turn number.
    pub turn: u64,
}

/// Mutable per-session budget state.
#[derive(Debug, Clone, Default)]
pub struct BudgetTracker {
    calls: HashMap<String, u32>,
    bytes: HashMap<String, u64>,
    turn: u64,
}

impl BudgetTracker {
    /// Fresh tracker at turn 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge one call and `byte_estimate` bytes to `tool`, or change nothing.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetExceeded`] when either limit would be passed.
    pub fn check_and_reserve(
        &mut self,
        tool: &str,
        limits: &BudgetLimits,
        byte_estimate: u64,
    ) -> Result<Reservation, BudgetExceeded> {
        let used_calls = self.calls_used(tool);
        if used_calls >= limits.calls_per_turn {
            return Err(BudgetExceeded::Calls {
                tool: tool.to_string(),
                used: used_calls,
                limit: limits.calls_per_turn,
            });
        }

        let used_bytes = self.bytes_used(tool);
        let new_bytes = used_bytes.saturating_add(byte_estimate);
        if let Some(limit) = limits.bytes_per_turn {
            if new_bytes > limit {
                return Err(BudgetExceeded::Bytes {
                    tool: tool.to_string(),
                    used: used_bytes,
                    requested: byte_estimate,
                    limit,
                });
            }
        }

        self.calls
            .insert(tool.to_string(), used_calls.saturating_add(1));
        self.bytes.insert(tool.to_string(), new_bytes);
        Ok(Reservation {
            turn: self.turn,
            bytes: byte_estimate,
        })
    }

    /// Undo a reservation entirely. No-op if the turn has since moved on.
    pub fn release(&mut self, tool: &str, reservation: &Reservation) {
        if reservation.turn != self.turn {
            return;
        }
        if let Some(calls) = self.calls.get_mut(tool) {
            *calls = calls.saturating_sub(1);
        }
        self.release_bytes(tool, reservation.turn, reservation.bytes);
    }

    /// Give back bytes charged in `turn`, keeping the call charged.
    pub fn release_bytes(&mut self, tool: &str, turn: u64, bytes: u64) {
        if turn != self.turn {
            return;
        }
        if let Some(used) = self.bytes.get_mut(tool) {
            *used = used.saturating_sub(bytes);
        }
    }

    /// Reset every counter and advance the turn by exactly one.
    pub fn new_turn(&mut self) -> u64 {
        self.calls.clear();
        self.bytes.clear();
        self.turn = self.turn.saturating_add(1);
        self.turn
    }

    /// Current turn number.
    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// Calls charged to `tool` this turn.
    pub fn calls_used(&self, tool: &str) -> u32 {
        self.calls.get(tool).copied().unwrap_or(0)
    }

    /// Bytes charged to `tool` this turn.
    pub fn bytes_used(&self, tool: &str) -> u64 {
        self.bytes.get(tool).copied().unwrap_or(0)
    }

    /// Copy of the counters.
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            calls: self.calls.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            bytes: self.bytes.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            turn: self.turn,
        }
    }
}
