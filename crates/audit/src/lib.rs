//! Append-only audit ledger for mutation governance decisions.
//!
//! Every execution produces exactly one [`AuditEntry`], regardless of
//! outcome — success, validation failure, policy denial or execution
//! error are all recorded (spec §4.5, §4.1 step 9 "Audit: always"). The
//! [`Auditor`] keeps entries in memory, in insertion order, queryable by
//! state id and an inclusive time range.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mutation_core::{Actor, Mode, MutationMetrics, PolicyDecision, ValidationResult};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Terminal outcome of one audited execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Committed,
    Simulated,
    Validated,
    ValidationFailed,
    PolicyBlocked,
    ExecutionFailed,
}

/// One append-only record of a mutation's governance trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub execution_id: String,
    pub state_id: String,
    pub operation: String,
    pub actor: Actor,
    pub mode: Mode,
    pub outcome: AuditOutcome,
    pub policy_decisions: Vec<PolicyDecision>,
    pub validation: Option<ValidationResult>,
    pub changed_paths: Vec<String>,
    pub metrics: Option<MutationMetrics>,
    pub exception_message: Option<String>,
    pub recorded_at_ms: u64,
}

impl AuditEntry {
    /// Construct an entry with a fresh id and the current timestamp,
    /// given the already-known execution facts.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        execution_id: impl Into<String>,
        state_id: impl Into<String>,
        operation: impl Into<String>,
        actor: Actor,
        mode: Mode,
        outcome: AuditOutcome,
        policy_decisions: Vec<PolicyDecision>,
        validation: Option<ValidationResult>,
        changed_paths: Vec<String>,
        metrics: Option<MutationMetrics>,
        exception_message: Option<String>,
    ) -> Self {
        Self {
            id: mutation_core::ids::next_monotonic_id(),
            execution_id: execution_id.into(),
            state_id: state_id.into(),
            operation: operation.into(),
            actor,
            mode,
            outcome,
            policy_decisions,
            validation,
            changed_paths,
            metrics,
            exception_message,
            recorded_at_ms: mutation_core::ids::now_ms(),
        }
    }
}

/// Thread-safe, append-only, in-memory audit ledger.
#[derive(Default)]
pub struct Auditor {
    entries: RwLock<Vec<AuditEntry>>,
}

impl Auditor {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry. Never fails, never overwrites.
    pub fn record(&self, entry: AuditEntry) {
        let mut w = self.entries.write().expect("auditor lock poisoned");
        w.push(entry);
    }

    /// Entries for `state_id`, optionally restricted to an inclusive
    /// `[from, to]` timestamp range, in insertion order.
    pub fn query(&self, state_id: &str, from: Option<u64>, to: Option<u64>) -> Vec<AuditEntry> {
        let r = self.entries.read().expect("auditor lock poisoned");
        r.iter()
            .filter(|e| e.state_id == state_id)
            .filter(|e| from.map_or(true, |f| e.recorded_at_ms >= f))
            .filter(|e| to.map_or(true, |t| e.recorded_at_ms <= t))
            .cloned()
            .collect()
    }

    /// Every entry ever recorded, in insertion order.
    pub fn all(&self) -> Vec<AuditEntry> {
        self.entries.read().expect("auditor lock poisoned").clone()
    }

    /// Total number of entries recorded.
    pub fn len(&self) -> usize {
        self.entries.read().expect("auditor lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
