//! Mutation engine core primitives and shared types.
//!
//! This crate has no knowledge of policies, interceptors, auditing, history
//! or metrics — it only defines the data model that those crates and the
//! engine itself exchange: intents, contexts, change sets, validation and
//! policy decisions, and the `Mutation` trait a caller implements.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version of the mutation-core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ids {
    //! ID and clock utilities shared by every other crate in the workspace.

    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};
    use uuid::Uuid;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate a new monotonic identifier (starts at 1). Used for audit
    /// and history entry ordinals.
    pub fn next_monotonic_id() -> u64 {
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Milliseconds since UNIX epoch.
    pub fn now_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
    }

    /// Opaque execution identifier (UUID v4, prefixed), generated fresh for
    /// every `executeSingle` call.
    pub fn new_execution_id() -> String {
        format!("exec-{}", Uuid::new_v4())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn monotonic_increments() {
            let a = next_monotonic_id();
            let b = next_monotonic_id();
            assert!(b > a);
        }

        #[test]
        fn execution_id_is_prefixed_and_unique() {
            let a = new_execution_id();
            let b = new_execution_id();
            assert!(a.starts_with("exec-"));
            assert_ne!(a, b);
        }
    }
}

/// Risk level declared by a mutation's intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Estimated blast radius of a mutation's intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlastRadius {
    Single,
    Module,
    System,
    Global,
}

/// Declarative description of what a mutation intends to change and why.
///
/// Immutable for the lifetime of the mutation (spec invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub operation: String,
    pub category: String,
    pub description: String,
    pub risk_level: RiskLevel,
    pub reversible: bool,
    pub blast_radius: BlastRadius,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at_ms: u64,
}

impl Intent {
    /// Construct an intent with empty tags/metadata and `created_at_ms` set
    /// to now.
    pub fn new(
        operation: impl Into<String>,
        category: impl Into<String>,
        description: impl Into<String>,
        risk_level: RiskLevel,
        reversible: bool,
        blast_radius: BlastRadius,
    ) -> Self {
        Self {
            operation: operation.into(),
            category: category.into(),
            description: description.into(),
            risk_level,
            reversible,
            blast_radius,
            tags: Vec::new(),
            metadata: BTreeMap::new(),
            created_at_ms: ids::now_ms(),
        }
    }

    /// Builder-style tag addition.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Builder-style metadata insertion.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Operating mode of a mutation execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Dry run: executed inline by the engine, never audited as a history write.
    Simulate,
    /// Checks only; `apply` is never invoked.
    Validate,
    /// Persistable apply, routed through the executor.
    Commit,
}

/// Classification of the actor that initiated a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Unknown,
    User,
    System,
    Service,
    Policy,
    Scheduler,
    Administrator,
}

/// Identity of the actor that initiated a mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub actor_type: ActorType,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, actor_type: ActorType) -> Self {
        Self { id: id.into(), name: name.into(), actor_type }
    }

    /// An actor representing an unidentified caller.
    pub fn unknown() -> Self {
        Self { id: String::new(), name: String::new(), actor_type: ActorType::Unknown }
    }
}

/// Metadata about who initiated a mutation, why, when, and in which mode.
///
/// Immutable for the lifetime of the mutation (spec invariant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationContext {
    pub mode: Mode,
    pub actor: Actor,
    pub reason: Option<String>,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub session_id: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp_ms: u64,
    pub timezone: Option<String>,
    pub culture: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl MutationContext {
    /// Construct a context for the given mode and actor, timestamped now.
    pub fn new(mode: Mode, actor: Actor) -> Self {
        Self {
            mode,
            actor,
            reason: None,
            correlation_id: None,
            causation_id: None,
            session_id: None,
            source_ip: None,
            user_agent: None,
            timestamp_ms: ids::now_ms(),
            timezone: None,
            culture: None,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Kind of a single state delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Modified,
    Added,
    Removed,
    Replaced,
    Moved,
}

/// A single path-scoped state delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    pub path: String,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub kind: ChangeKind,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub priority: Option<i32>,
}

impl StateChange {
    pub fn new(
        path: impl Into<String>,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        kind: ChangeKind,
    ) -> Self {
        Self { path: path.into(), before, after, kind, metadata: None, priority: None }
    }
}

/// Ordered sequence of state deltas produced by one or more mutations.
///
/// Insertion order is preserved; this is relied upon by replay and by
/// batch aggregation (spec invariants 4 and 8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
    changes: Vec<StateChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_changes(changes: Vec<StateChange>) -> Self {
        Self { changes }
    }

    pub fn push(&mut self, change: StateChange) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, StateChange> {
        self.changes.iter()
    }

    /// All changes recorded at exactly `path`.
    pub fn get_changes(&self, path: &str) -> Vec<&StateChange> {
        self.changes.iter().filter(|c| c.path == path).collect()
    }

    /// Whether any change touched `path`.
    pub fn is_changed(&self, path: &str) -> bool {
        self.changes.iter().any(|c| c.path == path)
    }

    /// Distinct paths touched, in first-seen order.
    pub fn changed_paths(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for c in &self.changes {
            if seen.insert(c.path.clone()) {
                out.push(c.path.clone());
            }
        }
        out
    }

    /// Append `other`'s changes after this set's, preserving both orders.
    /// Used by `executeBatch` to build the aggregated change-set (spec
    /// invariant 4).
    pub fn extend(&mut self, other: ChangeSet) {
        self.changes.extend(other.changes);
    }
}

impl IntoIterator for ChangeSet {
    type Item = StateChange;
    type IntoIter = std::vec::IntoIter<StateChange>;
    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

/// Severity of a validation issue or policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// A single validation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub message: String,
    pub code: Option<String>,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self { path: path.into(), message: message.into(), code: None, severity }
    }
}

/// The outcome of a mutation's `validate` phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub infos: Vec<ValidationIssue>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.errors.push(issue);
        self
    }

    #[must_use]
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A single requirement attached to a `RequireApproval` policy decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub data: Option<serde_json::Value>,
    pub is_fulfilled: bool,
}

/// The decision produced by evaluating one policy against a mutation and
/// state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub is_allowed: bool,
    pub reason: Option<String>,
    pub policy_name: Option<String>,
    pub severity: Severity,
    pub modifications: Option<BTreeMap<String, serde_json::Value>>,
    pub requirements: Option<Vec<Requirement>>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
    pub timestamp_ms: u64,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            is_allowed: true,
            reason: None,
            policy_name: None,
            severity: Severity::Info,
            modifications: None,
            requirements: None,
            metadata: None,
            timestamp_ms: ids::now_ms(),
        }
    }

    pub fn deny(policy_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            is_allowed: false,
            reason: Some(reason.into()),
            policy_name: Some(policy_name.into()),
            severity: Severity::Error,
            modifications: None,
            requirements: None,
            metadata: None,
            timestamp_ms: ids::now_ms(),
        }
    }

    pub fn deny_critical(policy_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut d = Self::deny(policy_name, reason);
        d.severity = Severity::Critical;
        d
    }

    pub fn modify(
        policy_name: impl Into<String>,
        modifications: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            is_allowed: true,
            reason: None,
            policy_name: Some(policy_name.into()),
            severity: Severity::Info,
            modifications: Some(modifications),
            requirements: None,
            metadata: None,
            timestamp_ms: ids::now_ms(),
        }
    }

    pub fn require_approval(policy_name: impl Into<String>, requirement: Requirement) -> Self {
        Self {
            is_allowed: false,
            reason: Some("approval required".to_string()),
            policy_name: Some(policy_name.into()),
            severity: Severity::Warning,
            modifications: None,
            requirements: Some(vec![requirement]),
            metadata: None,
            timestamp_ms: ids::now_ms(),
        }
    }
}

/// A single observed side effect surfaced by a mutation's `apply`.
///
/// Collected into `MutationResult::side_effects`; the engine does not
/// dispatch these anywhere (spec open question — downstream dispatch is
/// out of scope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideEffect {
    pub kind: String,
    pub description: String,
    pub data: Option<serde_json::Value>,
}

/// Per-execution metrics recorded by the engine and metrics collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationMetrics {
    pub recorded_at_ms: u64,
    pub execution_time_ms: u64,
    pub validation_time_ms: u64,
    pub policy_evaluation_time_ms: u64,
    pub validated_rules: u64,
    pub evaluated_policies: u64,
    pub changes_count: u64,
    pub state_size: Option<u64>,
    pub memory_used: Option<u64>,
    pub used_cache: bool,
    pub additional_metrics: BTreeMap<String, serde_json::Value>,
}

/// The outcome of applying or simulating a mutation, before the engine
/// wraps it into a [`MutationResult`].
///
/// This is what a [`Mutation`] implementation actually produces; the
/// engine folds in validation, policy decisions and metrics that the
/// mutation itself has no visibility into.
#[derive(Debug, Clone)]
pub struct ApplyOutcome<S> {
    pub new_state: S,
    pub changes: ChangeSet,
    pub side_effects: Vec<SideEffect>,
}

impl<S> ApplyOutcome<S> {
    pub fn new(new_state: S, changes: ChangeSet) -> Self {
        Self { new_state, changes, side_effects: Vec::new() }
    }

    #[must_use]
    pub fn with_side_effects(mut self, side_effects: Vec<SideEffect>) -> Self {
        self.side_effects = side_effects;
        self
    }
}

/// Error produced by a mutation's `apply`/`simulate`. Carries a message
/// only; the engine wraps it into its own execution-failure kind with an
/// execution id attached (spec §7).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct MutationError(pub String);

impl MutationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The full result of one `executeSingle` call, returned to the caller
/// whether the mutation succeeded, failed validation, or was blocked by
/// policy. Always carries a change-set (possibly empty) and a trace of
/// what was evaluated, even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationResult<S> {
    pub success: bool,
    pub new_state: Option<S>,
    pub changes: ChangeSet,
    pub validation: ValidationResult,
    pub policy_decisions: Vec<PolicyDecision>,
    #[serde(skip)]
    pub side_effects: Vec<SideEffect>,
    pub metrics: MutationMetrics,
    pub exception_message: Option<String>,
    pub completed_at_ms: u64,
}

impl<S> MutationResult<S> {
    /// A successful, committed (or simulated) result.
    pub fn success(new_state: S, changes: ChangeSet, side_effects: Vec<SideEffect>) -> Self {
        Self {
            success: true,
            new_state: Some(new_state),
            changes,
            validation: ValidationResult::valid(),
            policy_decisions: Vec::new(),
            side_effects,
            metrics: MutationMetrics::default(),
            exception_message: None,
            completed_at_ms: ids::now_ms(),
        }
    }

    /// A validation failure; `new_state` is absent.
    pub fn failure(validation: ValidationResult) -> Self {
        Self {
            success: false,
            new_state: None,
            changes: ChangeSet::new(),
            validation,
            policy_decisions: Vec::new(),
            side_effects: Vec::new(),
            metrics: MutationMetrics::default(),
            exception_message: None,
            completed_at_ms: ids::now_ms(),
        }
    }

    /// A policy denial; `new_state` is absent and the blocking decision is
    /// recorded as the sole policy decision.
    pub fn policy_blocked(decision: PolicyDecision) -> Self {
        Self {
            success: false,
            new_state: None,
            changes: ChangeSet::new(),
            validation: ValidationResult::valid(),
            policy_decisions: vec![decision],
            side_effects: Vec::new(),
            metrics: MutationMetrics::default(),
            exception_message: None,
            completed_at_ms: ids::now_ms(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

/// A unit of state change bound to a specific state type `S`.
///
/// Implementations must keep `validate` and `simulate` free of observable
/// side effects on `state`, and `apply` must be deterministic for
/// identical `(state, intent, context)` (spec §3 invariants). `Sync` is
/// required so the executor can hand a mutation to a scoped worker
/// thread while timing out the caller's wait (spec §4.2, §5).
pub trait Mutation<S>: Sync {
    /// Declarative description of this mutation (immutable for its
    /// lifetime).
    fn intent(&self) -> &Intent;

    /// Who/why/when/mode this mutation is executing under (immutable for
    /// its lifetime).
    fn context(&self) -> &MutationContext;

    /// Pure check; must not mutate `state` or produce side effects.
    fn validate(&self, state: &S) -> ValidationResult;

    /// Must behave identically to `apply` except no persistence is
    /// implied by the caller.
    fn simulate(&self, state: &S) -> Result<ApplyOutcome<S>, MutationError>;

    /// Deterministic application of this mutation to `state`.
    fn apply(&self, state: &S) -> Result<ApplyOutcome<S>, MutationError>;
}
