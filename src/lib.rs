//! Tollgate: an authorization kernel for agent tool calls.
//!
//! Sits between an untrusted action-proposing layer and the trusted tool
//! executor. Every proposal is decided by the gate, the decision is appended
//! to a per-session hash-chained ledger, and executions can be recorded and
//! replayed later without touching real side effects.
//!
//! See `DESIGN.md` for the component map.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod config;
pub mod logging;

pub mod kernel;
pub mod store;
pub mod tools;
