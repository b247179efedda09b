//! In-memory mutation history store.
//!
//! Every committed mutation appends one [`HistoryEntry`] keyed by its
//! state id (spec §4.1 step 9: "History: commit-success only" — neither
//! simulated nor validate-only executions are recorded here, that's the
//! auditor's job). The store supports range and recency queries, replay
//! of the change-set sequence via a caller-supplied fold function, a
//! per-path timeline, and summary statistics.
//!
//! Entries are chained by hash the way a tamper-evident ledger is: each
//! entry's `new_hash` folds in the previous entry's hash, so replaying a
//! state's entries in order and recomputing the chain detects any
//! reordering or deletion. This is optional per the spec ("previousHash?,
//! newHash?") and is not verified anywhere in the core pipeline; it is
//! here for a consumer that wants to audit the ledger's own integrity.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mutation_core::{ChangeSet, Intent, MutationContext, SideEffect, StateChange};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

/// Errors raised by history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// `append` was called with an empty state id.
    #[error("stable stateId required")]
    MissingStateId,
}

/// One committed mutation, recorded against the state it was applied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub state_id: String,
    pub execution_id: String,
    pub intent: Intent,
    pub context: MutationContext,
    pub changes: ChangeSet,
    pub side_effects: Vec<SideEffect>,
    pub execution_time_ms: u64,
    pub recorded_at_ms: u64,
    pub previous_hash: Option<String>,
    pub new_hash: Option<String>,
}

impl HistoryEntry {
    /// Construct an entry with a fresh id and the current timestamp.
    /// `previous_hash`/`new_hash` are filled in by [`History::append`],
    /// which alone knows the prior entry for this state id.
    pub fn new(
        state_id: impl Into<String>,
        execution_id: impl Into<String>,
        intent: Intent,
        context: MutationContext,
        changes: ChangeSet,
        side_effects: Vec<SideEffect>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            id: mutation_core::ids::next_monotonic_id(),
            state_id: state_id.into(),
            execution_id: execution_id.into(),
            intent,
            context,
            changes,
            side_effects,
            execution_time_ms,
            recorded_at_ms: mutation_core::ids::now_ms(),
            previous_hash: None,
            new_hash: None,
        }
    }
}

fn chain_hash(previous_hash: Option<&str>, state_id: &str, execution_id: &str, changes: &ChangeSet) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = previous_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(state_id.as_bytes());
    hasher.update(execution_id.as_bytes());
    if let Ok(serialized) = serde_json::to_vec(changes) {
        hasher.update(&serialized);
    }
    hex::encode(hasher.finalize())
}

/// One recorded change at a path, with the provenance of the commit that
/// produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp_ms: u64,
    pub change: StateChange,
    pub execution_id: String,
    pub actor_id: String,
    pub reason: Option<String>,
}

/// Summary statistics over one state id's recorded history (spec §4.6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStatistics {
    pub total_mutations: u64,
    pub unique_actors: u64,
    pub mutations_by_category: BTreeMap<String, u64>,
    pub average_changes_per_mutation: f64,
}

/// Thread-safe, in-memory, append-only history store keyed by state id.
#[derive(Default)]
pub struct History {
    by_state: RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

impl History {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry under its own `state_id`, chaining it to the
    /// previous entry's hash. Fails if `state_id` is empty.
    pub fn append(&self, mut entry: HistoryEntry) -> Result<(), HistoryError> {
        if entry.state_id.trim().is_empty() {
            return Err(HistoryError::MissingStateId);
        }
        let mut w = self.by_state.write().expect("history lock poisoned");
        let bucket = w.entry(entry.state_id.clone()).or_default();
        let previous_hash = bucket.last().and_then(|e| e.new_hash.clone());
        entry.new_hash = Some(chain_hash(
            previous_hash.as_deref(),
            &entry.state_id,
            &entry.execution_id,
            &entry.changes,
        ));
        entry.previous_hash = previous_hash;
        bucket.push(entry);
        Ok(())
    }

    /// All entries for `state_id`, in append (chronological) order.
    /// Unknown state ids yield an empty history, not an error.
    pub fn get(&self, state_id: &str) -> Vec<HistoryEntry> {
        let r = self.by_state.read().expect("history lock poisoned");
        r.get(state_id).cloned().unwrap_or_default()
    }

    /// Entries for `state_id` recorded within an inclusive `[from, to]`
    /// timestamp range, ascending.
    pub fn get_range(&self, state_id: &str, from_ms: u64, to_ms: u64) -> Vec<HistoryEntry> {
        self.get(state_id)
            .into_iter()
            .filter(|e| e.recorded_at_ms >= from_ms && e.recorded_at_ms <= to_ms)
            .collect()
    }

    /// The most recent `limit` entries for `state_id`, descending by
    /// timestamp (most recent first).
    pub fn get_recent(&self, state_id: &str, limit: usize) -> Vec<HistoryEntry> {
        let mut entries = self.get(state_id);
        entries.reverse();
        entries.truncate(limit);
        entries
    }

    /// Fold `apply_fn(state, &changes)` over every entry recorded for
    /// `state_id`, in chronological order, starting from `initial`.
    pub fn replay<S>(&self, state_id: &str, initial: S, apply_fn: impl Fn(S, &ChangeSet) -> S) -> S {
        self.get(state_id).iter().fold(initial, |acc, e| apply_fn(acc, &e.changes))
    }

    /// Same as [`replay`](Self::replay), restricted to entries recorded
    /// at or before `until_ms`. If no entry qualifies, returns `initial`
    /// unchanged.
    pub fn replay_until<S>(
        &self,
        state_id: &str,
        until_ms: u64,
        initial: S,
        apply_fn: impl Fn(S, &ChangeSet) -> S,
    ) -> S {
        self.get(state_id)
            .iter()
            .filter(|e| e.recorded_at_ms <= until_ms)
            .fold(initial, |acc, e| apply_fn(acc, &e.changes))
    }

    /// Every recorded change touching `path` for `state_id`, in
    /// chronological order, paired with the commit that produced it.
    pub fn timeline_for_path(&self, state_id: &str, path: &str) -> Vec<TimelineEvent> {
        let mut out = Vec::new();
        for entry in self.get(state_id) {
            for change in entry.changes.get_changes(path) {
                out.push(TimelineEvent {
                    timestamp_ms: entry.recorded_at_ms,
                    change: change.clone(),
                    execution_id: entry.execution_id.clone(),
                    actor_id: entry.context.actor.id.clone(),
                    reason: entry.context.reason.clone(),
                });
            }
        }
        out
    }

    /// Summary statistics for `state_id`. Returns the zero-value default
    /// if nothing has been recorded.
    pub fn statistics(&self, state_id: &str) -> HistoryStatistics {
        let entries = self.get(state_id);
        let mut stats = HistoryStatistics::default();
        stats.total_mutations = entries.len() as u64;
        if entries.is_empty() {
            return stats;
        }
        let mut actors = HashSet::new();
        let mut total_changes: u64 = 0;
        for entry in &entries {
            total_changes += entry.changes.len() as u64;
            actors.insert(entry.context.actor.id.clone());
            *stats.mutations_by_category.entry(entry.intent.category.clone()).or_insert(0) += 1;
        }
        stats.unique_actors = actors.len() as u64;
        stats.average_changes_per_mutation = total_changes as f64 / entries.len() as f64;
        stats
    }

    /// Every state id with at least one recorded entry.
    pub fn known_state_ids(&self) -> Vec<String> {
        self.by_state.read().expect("history lock poisoned").keys().cloned().collect()
    }
}
