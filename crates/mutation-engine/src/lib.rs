//! The mutation governance engine: wires policy evaluation, interceptors,
//! auditing, history and metrics around a caller-supplied [`Mutation`]
//! implementation (spec §4.1, §4.2).
//!
//! Pipeline, in order, for one `execute_single` call:
//! 1. Open a metrics scope; snapshot registered interceptors; run `on_before`.
//! 2. Evaluate policies in priority order (see [`policy::evaluate`]).
//!    A deny or a modification short-circuits; otherwise the synthetic
//!    decision is Allow.
//! 3. Validate the mutation against the current state.
//! 4. Execute (unless `Mode::Validate`): `apply` for `Commit`, `simulate`
//!    for `Simulate`, subject to the configured timeout and cancellation
//!    (see [`executor`]).
//! 5. Run `on_after` (success) or `on_failed`/`on_policy_blocked`.
//! 6. Audit: always, regardless of outcome.
//! 7. History: only on a successful `Commit`.
//! 8. Metrics: always — every terminal branch records a sample.
//!
//! Validation and policy denial are folded into the returned
//! `MutationResult` (`Ok(..)` with `success: false`); only timeout,
//! cancellation and an `apply`/`simulate` error are raised as
//! [`EngineError`] (spec §7).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod executor;

use audit::{AuditEntry, AuditOutcome, Auditor};
use executor::{CancellationToken, Executor, ExecutorError};
use history::{History, HistoryEntry, HistoryStatistics};
use interceptors::{Interceptor, InterceptorPipeline};
use metrics::{AggregateReport, MetricSample, MetricsCollector};
use mutation_core::{
    ChangeSet, Mode, Mutation, MutationError, MutationResult, PolicyDecision,
};
use policy::{Policy, PolicyPriorityOverrides, PolicyRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, info_span, warn};

/// Errors raised by `execute_single`/`execute_batch`. Validation failure
/// and policy denial are *not* members of this type — they are folded
/// into the returned `MutationResult` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The execute phase did not complete within the configured timeout.
    /// Carries the configured timeout and the actual elapsed time, both
    /// in milliseconds (spec §7 item 3, Scenario E).
    #[error("execution timed out after {1}ms (configured {0}ms)")]
    Timeout(u64, u64),
    /// The execution was cancelled.
    #[error("execution cancelled")]
    Cancelled,
    /// `apply`/`simulate` returned an error.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

impl From<ExecutorError> for EngineError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::Timeout(configured_ms, elapsed_ms) => {
                EngineError::Timeout(configured_ms, elapsed_ms)
            }
            ExecutorError::Cancelled => EngineError::Cancelled,
            ExecutorError::Failed(msg) => EngineError::ExecutionFailed(msg),
        }
    }
}

/// Engine-wide configuration. Two presets are provided as constructors
/// rather than a string-keyed bag (spec §9 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEngineOptions {
    /// Whether to run `validate` even when `mode != Commit`.
    pub always_validate: bool,
    /// Milliseconds allowed for the execute phase before it is treated
    /// as timed out.
    pub execution_timeout_ms: u64,
    /// Maximum number of mutations accepted in one `execute_batch` call.
    pub max_batch_size: usize,
    /// Whether `execute_batch` stops at the first failing mutation
    /// (folded failure or raised error) or continues through the batch.
    pub stop_batch_on_first_failure: bool,
}

impl Default for MutationEngineOptions {
    fn default() -> Self {
        Self {
            always_validate: false,
            execution_timeout_ms: 30_000,
            max_batch_size: 100,
            stop_batch_on_first_failure: false,
        }
    }
}

impl MutationEngineOptions {
    /// A conservative preset: always validate, short timeout, stop at
    /// the first batch failure. Suited to interactive or user-facing
    /// call sites.
    pub fn strict() -> Self {
        Self {
            always_validate: true,
            execution_timeout_ms: 5_000,
            max_batch_size: 20,
            stop_batch_on_first_failure: true,
        }
    }

    /// A throughput-oriented preset: no forced validation, no timeout,
    /// keep processing a batch past individual failures. Suited to
    /// bulk/background jobs.
    pub fn performance() -> Self {
        Self {
            always_validate: false,
            execution_timeout_ms: u64::MAX,
            max_batch_size: 1_000,
            stop_batch_on_first_failure: false,
        }
    }

    /// Load options from a YAML document, the way `policy`'s priority
    /// overrides are loaded.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load options from a YAML file at `path`.
    pub fn load_from_yaml_path<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml_str(&contents)?)
    }
}

/// A constant placeholder for state-size estimation until a
/// serializer-backed implementation is justified (spec §9).
fn estimate_state_size<S>(_state: &S) -> u64 {
    metrics::PLACEHOLDER_STATE_SIZE_BYTES
}

/// Applies a policy decision's `modifications` map, if present, to an
/// already-successful result. Reserved: the spec leaves the schema of
/// `modifications` unspecified, so this is a documented no-op extension
/// point (spec §9 open question).
fn apply_modifications<S>(_modifications: &std::collections::BTreeMap<String, serde_json::Value>, _result: &mut MutationResult<S>) {
}

/// Aggregate statistics across every execution this engine has recorded
/// metrics for (spec §4.1 `getStatistics`). Distinct from
/// [`MutationEngine::get_history_statistics`], which is scoped to one
/// state id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatistics {
    pub total_executed: u64,
    pub average_execution_time_ms: f64,
    pub median_execution_time_ms: u64,
    pub p95_execution_time_ms: u64,
    /// Executions per second over the aggregated window (spec §4.7).
    pub throughput_per_second: f64,
    pub last_updated_at_ms: Option<u64>,
}

impl From<AggregateReport> for EngineStatistics {
    fn from(r: AggregateReport) -> Self {
        Self {
            total_executed: r.count,
            average_execution_time_ms: r.mean_execution_time_ms,
            median_execution_time_ms: r.p50_execution_time_ms,
            p95_execution_time_ms: r.p95_execution_time_ms,
            throughput_per_second: r.throughput_per_second,
            last_updated_at_ms: None,
        }
    }
}

/// The outcome of running a sequence of mutations through
/// [`MutationEngine::execute_batch`] (spec §4.1 `executeBatch`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult<S> {
    /// Every per-mutation result, in the order the mutations were given.
    /// Truncated if the batch stopped early on cancellation or
    /// `stop_batch_on_first_failure`.
    pub results: Vec<MutationResult<S>>,
    /// `true` iff every mutation in `results` succeeded.
    pub success: bool,
    /// The state after folding every successful mutation's `new_state`
    /// in order, or `None` if any mutation failed.
    pub final_state: Option<S>,
    /// The ordered concatenation of every successful mutation's
    /// change-set (spec invariant 4).
    pub changes: ChangeSet,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_execution_time_ms: u64,
}

/// The mutation governance engine for one state type `S`.
pub struct MutationEngine<S> {
    policies: Arc<PolicyRegistry<S>>,
    interceptors: Arc<InterceptorPipeline<S>>,
    auditor: Arc<Auditor>,
    history: Arc<History>,
    metrics: Arc<MetricsCollector>,
    options: MutationEngineOptions,
}

impl<S> MutationEngine<S> {
    /// Build an engine with the given options and empty policy/
    /// interceptor registries.
    pub fn new(options: MutationEngineOptions) -> Self {
        Self {
            policies: Arc::new(PolicyRegistry::new()),
            interceptors: Arc::new(InterceptorPipeline::new()),
            auditor: Arc::new(Auditor::new()),
            history: Arc::new(History::new()),
            metrics: Arc::new(MetricsCollector::new()),
            options,
        }
    }

    /// Register a policy.
    pub fn register_policy(&self, policy: Arc<dyn Policy<S>>) {
        self.policies.register(policy);
    }

    /// Register a policy with a priority override applied at
    /// registration.
    pub fn register_policy_with_overrides(
        &self,
        policy: Arc<dyn Policy<S>>,
        overrides: &PolicyPriorityOverrides,
    ) {
        self.policies.register_with_overrides(policy, overrides);
    }

    /// Register an interceptor.
    pub fn register_interceptor(&self, interceptor: Arc<dyn Interceptor<S>>) {
        self.interceptors.register(interceptor);
    }

    /// History entries recorded for `state_id`.
    pub fn get_history(&self, state_id: &str) -> Vec<HistoryEntry> {
        self.history.get(state_id)
    }

    /// History summary statistics for `state_id`.
    pub fn get_history_statistics(&self, state_id: &str) -> HistoryStatistics {
        self.history.statistics(state_id)
    }

    /// Audit entries recorded for `state_id`.
    pub fn get_audit_trail(&self, state_id: &str) -> Vec<AuditEntry> {
        self.auditor.query(state_id, None, None)
    }

    /// Aggregate statistics across every execution this engine has ever
    /// recorded metrics for (spec §4.1 `getStatistics`).
    pub fn get_statistics(&self) -> EngineStatistics {
        let mut stats: EngineStatistics = self.metrics.aggregate_all().into();
        stats.last_updated_at_ms = self.metrics.last_recorded_at_ms();
        stats
    }

    /// Direct access to the metrics collector, e.g. for windowed
    /// `aggregate`.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Execute one mutation against `state`, identified by `state_id`
    /// for audit/history keying.
    pub async fn execute_single(
        &self,
        state_id: &str,
        mutation: &dyn Mutation<S>,
        state: &S,
        cancellation: Option<&CancellationToken>,
    ) -> Result<MutationResult<S>, EngineError>
    where
        S: Sync,
        mutation_core::ApplyOutcome<S>: Send,
    {
        let execution_id = mutation_core::ids::new_execution_id();
        let operation = mutation.intent().operation.clone();
        let mode = mutation.context().mode;
        let actor = mutation.context().actor.clone();

        let span = info_span!(
            "mutation.execute",
            state_id = %state_id,
            execution_id = %execution_id,
            operation = %operation,
            mode = ?mode,
        );
        let _entered = span.enter();

        let mut scope = self.metrics.begin_scope(execution_id.clone());
        scope.set_state_size(estimate_state_size(state));

        let snapshot = self.interceptors.snapshot();
        InterceptorPipeline::run_before(&snapshot, mutation, state);

        let policy_start = Instant::now();
        let policies = self.policies.get_policies();
        let policy_outcome = {
            let _span = info_span!("mutation.policy.evaluate").entered();
            policy::evaluate(&policies, mutation, state)
        };
        let policy_evaluation_time_ms = policy_start.elapsed().as_millis() as u64;
        scope.set_policy_evaluation_time_ms(policy_evaluation_time_ms);

        if !policy_outcome.effective.is_allowed {
            warn!(policy = ?policy_outcome.effective.policy_name, "mutation blocked by policy");
            InterceptorPipeline::run_policy_blocked(&snapshot, mutation, &policy_outcome.effective);
            self.auditor.record(AuditEntry::new(
                execution_id.clone(),
                state_id,
                operation.clone(),
                actor,
                mode,
                AuditOutcome::PolicyBlocked,
                policy_outcome.evaluated.clone(),
                None,
                Vec::new(),
                None,
                policy_outcome.effective.reason.clone(),
            ));
            let metrics = scope.build(0, policy_outcome.evaluated.len() as u64, 0, false);
            self.metrics.record(MetricSample::from_metrics(operation, false, &metrics));
            let mut result = MutationResult::policy_blocked(policy_outcome.effective);
            result.policy_decisions = policy_outcome.evaluated;
            result.metrics = metrics;
            return Ok(result);
        }

        let should_validate =
            mode == Mode::Commit || mode == Mode::Validate || self.options.always_validate;
        let validation_start = Instant::now();
        let validation = if should_validate {
            let _span = info_span!("mutation.validate").entered();
            mutation.validate(state)
        } else {
            mutation_core::ValidationResult::valid()
        };
        let validation_time_ms = validation_start.elapsed().as_millis() as u64;
        scope.set_validation_time_ms(validation_time_ms);

        if should_validate && !validation.is_valid() {
            let synthetic =
                MutationError::new(format!("{} validation error(s)", validation.errors.len()));
            InterceptorPipeline::run_failed(&snapshot, mutation, &synthetic);
            self.auditor.record(AuditEntry::new(
                execution_id.clone(),
                state_id,
                operation.clone(),
                actor,
                mode,
                AuditOutcome::ValidationFailed,
                policy_outcome.evaluated.clone(),
                Some(validation.clone()),
                Vec::new(),
                None,
                None,
            ));
            let validated_rules = (validation.errors.len() + validation.warnings.len()) as u64;
            let metrics = scope.build(validated_rules, policy_outcome.evaluated.len() as u64, 0, false);
            self.metrics.record(MetricSample::from_metrics(operation, false, &metrics));
            let mut result = MutationResult::failure(validation);
            result.metrics = metrics;
            return Ok(result);
        }

        if mode == Mode::Validate {
            info!("validation-only mutation passed");
            self.auditor.record(AuditEntry::new(
                execution_id.clone(),
                state_id,
                operation.clone(),
                actor,
                mode,
                AuditOutcome::Validated,
                policy_outcome.evaluated.clone(),
                Some(validation.clone()),
                Vec::new(),
                None,
                None,
            ));
            let validated_rules = (validation.errors.len() + validation.warnings.len()) as u64;
            let metrics = scope.build(validated_rules, policy_outcome.evaluated.len() as u64, 0, false);
            self.metrics.record(MetricSample::from_metrics(operation, true, &metrics));
            let result: MutationResult<S> = MutationResult {
                success: true,
                new_state: None,
                changes: ChangeSet::new(),
                validation,
                policy_decisions: policy_outcome.evaluated,
                side_effects: Vec::new(),
                metrics,
                exception_message: None,
                completed_at_ms: mutation_core::ids::now_ms(),
            };
            return Ok(result);
        }

        let executor = Executor::new(self.options.execution_timeout_ms);
        let outcome = executor.run(mutation, state, mode, cancellation).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let engine_err: EngineError = e.into();
                let synthetic = MutationError::new(engine_err.to_string());
                InterceptorPipeline::run_failed(&snapshot, mutation, &synthetic);
                self.auditor.record(AuditEntry::new(
                    execution_id.clone(),
                    state_id,
                    operation.clone(),
                    actor,
                    mode,
                    AuditOutcome::ExecutionFailed,
                    policy_outcome.evaluated,
                    Some(validation),
                    Vec::new(),
                    None,
                    Some(engine_err.to_string()),
                ));
                return Err(engine_err);
            }
        };

        let changed_paths = outcome.changes.changed_paths();
        let validated_rules = (validation.errors.len() + validation.warnings.len()) as u64;
        let metrics = scope.build(
            validated_rules,
            policy_outcome.evaluated.len() as u64,
            outcome.changes.len() as u64,
            false,
        );

        let mut result = MutationResult::success(
            outcome.new_state,
            outcome.changes.clone(),
            outcome.side_effects.clone(),
        );
        result.validation = validation.clone();
        result.policy_decisions = policy_outcome.evaluated.clone();
        result.metrics = metrics.clone();

        if let Some(modifications) = &policy_outcome.effective.modifications {
            apply_modifications(modifications, &mut result);
        }

        InterceptorPipeline::run_after(&snapshot, mutation, &result);

        let audit_outcome =
            if mode == Mode::Simulate { AuditOutcome::Simulated } else { AuditOutcome::Committed };
        self.auditor.record(AuditEntry::new(
            execution_id.clone(),
            state_id,
            operation.clone(),
            actor.clone(),
            mode,
            audit_outcome,
            policy_outcome.evaluated,
            Some(validation),
            changed_paths,
            Some(metrics.clone()),
            None,
        ));

        if mode == Mode::Commit {
            self.history
                .append(HistoryEntry::new(
                    state_id,
                    execution_id.clone(),
                    mutation.intent().clone(),
                    mutation.context().clone(),
                    result.changes.clone(),
                    outcome.side_effects,
                    metrics.execution_time_ms,
                ))
                .expect("state_id must be non-empty for a commit");
        }

        self.metrics.record(MetricSample::from_metrics(operation, true, &metrics));

        Ok(result)
    }

    /// Execute `mutations` against `state` in order, threading the
    /// evolving state from one mutation's successful `new_state` into
    /// the next (spec §4.1 `executeBatch`).
    ///
    /// Stops early if [`MutationEngineOptions::stop_batch_on_first_failure`]
    /// is set and a mutation fails, or if `cancellation` is observed
    /// between iterations. `final_state` is only populated when every
    /// attempted mutation in `results` succeeded.
    pub async fn execute_batch(
        &self,
        state_id: &str,
        mutations: &[&dyn Mutation<S>],
        state: &S,
        cancellation: Option<&CancellationToken>,
    ) -> Result<BatchResult<S>, EngineError>
    where
        S: Clone + Sync,
        mutation_core::ApplyOutcome<S>: Send,
    {
        let batch_start = Instant::now();
        let mut results = Vec::new();
        let mut aggregated_changes = ChangeSet::new();
        let mut current_state = state.clone();
        let mut all_succeeded = true;
        let limit = mutations.len().min(self.options.max_batch_size);
        if limit < mutations.len() {
            warn!(
                requested = mutations.len(),
                max_batch_size = self.options.max_batch_size,
                dropped = mutations.len() - limit,
                "batch truncated to max_batch_size; trailing mutations not executed"
            );
        }

        for mutation in &mutations[..limit] {
            if cancellation.is_some_and(CancellationToken::is_cancelled) {
                break;
            }

            let result = self.execute_single(state_id, *mutation, &current_state, cancellation).await?;
            let succeeded = result.is_success();
            if succeeded {
                aggregated_changes.extend(result.changes.clone());
                if let Some(next_state) = result.new_state.clone() {
                    current_state = next_state;
                }
            } else {
                all_succeeded = false;
            }
            results.push(result);

            if !succeeded && self.options.stop_batch_on_first_failure {
                break;
            }
        }

        let success_count = results.iter().filter(|r| r.is_success()).count() as u64;
        let failure_count = results.len() as u64 - success_count;

        Ok(BatchResult {
            results,
            success: all_succeeded,
            final_state: if all_succeeded { Some(current_state) } else { None },
            changes: aggregated_changes,
            success_count,
            failure_count,
            total_execution_time_ms: batch_start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutation_core::{
        ApplyOutcome, Actor, BlastRadius, ChangeKind, Intent, MutationContext, RiskLevel,
        Severity, StateChange, ValidationIssue, ValidationResult,
    };

    #[derive(Clone)]
    struct Counter(i64);

    struct Increment {
        intent: Intent,
        context: MutationContext,
        by: i64,
    }

    impl Increment {
        fn new(mode: Mode, by: i64) -> Self {
            Self {
                intent: Intent::new(
                    "Increment",
                    "counter",
                    "increments the counter",
                    RiskLevel::Low,
                    true,
                    BlastRadius::Single,
                ),
                context: MutationContext::new(mode, Actor::new("u1", "tester", mutation_core::ActorType::User)),
                by,
            }
        }
    }

    impl Mutation<Counter> for Increment {
        fn intent(&self) -> &Intent {
            &self.intent
        }
        fn context(&self) -> &MutationContext {
            &self.context
        }
        fn validate(&self, _state: &Counter) -> ValidationResult {
            if self.by == 0 {
                return ValidationResult::valid().with_error(ValidationIssue::new(
                    "by",
                    "increment must be non-zero",
                    Severity::Error,
                ));
            }
            ValidationResult::valid()
        }
        fn simulate(&self, state: &Counter) -> Result<ApplyOutcome<Counter>, MutationError> {
            self.apply(state)
        }
        fn apply(&self, state: &Counter) -> Result<ApplyOutcome<Counter>, MutationError> {
            let mut changes = ChangeSet::new();
            changes.push(StateChange::new(
                "value",
                Some(serde_json::json!(state.0)),
                Some(serde_json::json!(state.0 + self.by)),
                ChangeKind::Modified,
            ));
            Ok(ApplyOutcome::new(Counter(state.0 + self.by), changes))
        }
    }

    struct AlwaysDeny;

    impl Policy<Counter> for AlwaysDeny {
        fn name(&self) -> &str {
            "AlwaysDeny"
        }
        fn priority(&self) -> i32 {
            100
        }
        fn evaluate(
            &self,
            _mutation: &dyn Mutation<Counter>,
            _state: &Counter,
        ) -> PolicyDecision {
            PolicyDecision::deny("AlwaysDeny", "blocked for test")
        }
    }

    #[tokio::test]
    async fn commit_mode_updates_history_and_metrics() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::default());
        let mutation = Increment::new(Mode::Commit, 3);
        let state = Counter(10);
        let result =
            engine.execute_single("counter-1", &mutation, &state, None).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.new_state.unwrap().0, 13);
        assert_eq!(engine.get_history("counter-1").len(), 1);
        assert_eq!(engine.metrics().aggregate_all().count, 1);
        assert_eq!(engine.get_audit_trail("counter-1").len(), 1);
        assert_eq!(engine.get_statistics().total_executed, 1);
    }

    #[tokio::test]
    async fn simulate_mode_does_not_write_history() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::default());
        let mutation = Increment::new(Mode::Simulate, 3);
        let state = Counter(10);
        let result =
            engine.execute_single("counter-2", &mutation, &state, None).await.unwrap();
        assert!(result.is_success());
        assert!(engine.get_history("counter-2").is_empty());
        assert_eq!(engine.get_audit_trail("counter-2").len(), 1);
    }

    #[tokio::test]
    async fn validate_mode_never_calls_apply() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::default());
        let mutation = Increment::new(Mode::Validate, 3);
        let state = Counter(10);
        let result =
            engine.execute_single("counter-3", &mutation, &state, None).await.unwrap();
        assert!(result.is_success());
        assert!(result.new_state.is_none());
        assert!(engine.get_history("counter-3").is_empty());
    }

    #[tokio::test]
    async fn validate_mode_surfaces_validation_errors() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::default());
        let mutation = Increment::new(Mode::Validate, 0);
        let state = Counter(10);
        let result =
            engine.execute_single("counter-3b", &mutation, &state, None).await.unwrap();
        assert!(!result.is_success());
        assert!(!result.validation.errors.is_empty());
        assert!(engine.get_history("counter-3b").is_empty());
    }

    #[tokio::test]
    async fn validation_failure_is_folded_not_raised() {
        let engine: MutationEngine<Counter> =
            MutationEngine::new(MutationEngineOptions::strict());
        let mutation = Increment::new(Mode::Commit, 0);
        let state = Counter(10);
        let result =
            engine.execute_single("counter-4", &mutation, &state, None).await.unwrap();
        assert!(!result.is_success());
        assert!(engine.get_history("counter-4").is_empty());
    }

    #[tokio::test]
    async fn policy_denial_is_folded_not_raised() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::default());
        engine.register_policy(Arc::new(AlwaysDeny));
        let mutation = Increment::new(Mode::Commit, 3);
        let state = Counter(10);
        let result =
            engine.execute_single("counter-5", &mutation, &state, None).await.unwrap();
        assert!(!result.is_success());
        assert_eq!(result.policy_decisions.len(), 1);
        assert!(engine.get_history("counter-5").is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_raises_engine_error() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::default());
        let mutation = Increment::new(Mode::Commit, 3);
        let state = Counter(10);
        let token = CancellationToken::new();
        token.cancel();
        let result = engine.execute_single("counter-6", &mutation, &state, Some(&token)).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn batch_threads_state_between_mutations() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::default());
        let m1 = Increment::new(Mode::Commit, 1);
        let m2 = Increment::new(Mode::Commit, 2);
        let mutations: Vec<&dyn Mutation<Counter>> = vec![&m1, &m2];
        let state = Counter(0);
        let batch = engine.execute_batch("counter-7", &mutations, &state, None).await.unwrap();
        assert!(batch.success);
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.final_state.unwrap().0, 3);
        assert_eq!(batch.success_count, 2);
        assert_eq!(batch.failure_count, 0);
    }

    #[tokio::test]
    async fn batch_with_middle_denial_continues_when_not_stopping() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::performance());
        engine.register_policy(Arc::new(AlwaysDeny));
        let m1 = Increment::new(Mode::Commit, 1);
        let m2 = Increment::new(Mode::Commit, 1);
        let mutations: Vec<&dyn Mutation<Counter>> = vec![&m1, &m2];
        let state = Counter(0);
        let batch = engine.execute_batch("counter-8", &mutations, &state, None).await.unwrap();
        assert!(!batch.success);
        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.failure_count, 2);
        assert!(batch.final_state.is_none());
    }

    #[tokio::test]
    async fn batch_stops_on_first_failure_when_configured() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::strict());
        let m1 = Increment::new(Mode::Commit, 0);
        let m2 = Increment::new(Mode::Commit, 1);
        let mutations: Vec<&dyn Mutation<Counter>> = vec![&m1, &m2];
        let state = Counter(0);
        let batch = engine.execute_batch("counter-9", &mutations, &state, None).await.unwrap();
        assert_eq!(batch.results.len(), 1);
        assert!(!batch.success);
    }

    #[tokio::test]
    async fn empty_batch_succeeds_with_input_state() {
        let engine: MutationEngine<Counter> = MutationEngine::new(MutationEngineOptions::default());
        let mutations: Vec<&dyn Mutation<Counter>> = Vec::new();
        let state = Counter(7);
        let batch = engine.execute_batch("counter-10", &mutations, &state, None).await.unwrap();
        assert!(batch.success);
        assert_eq!(batch.final_state.unwrap().0, 7);
        assert!(batch.changes.is_empty());
        assert_eq!(batch.results.len(), 0);
    }

    #[test]
    fn presets_differ_in_timeout_and_batch_size() {
        let strict = MutationEngineOptions::strict();
        let performance = MutationEngineOptions::performance();
        assert!(strict.execution_timeout_ms < performance.execution_timeout_ms);
        assert!(strict.max_batch_size < performance.max_batch_size);
        assert!(strict.always_validate);
        assert!(!performance.always_validate);
    }

    struct BlockingIncrement {
        intent: Intent,
        context: MutationContext,
    }

    impl BlockingIncrement {
        fn new() -> Self {
            Self {
                intent: Intent::new(
                    "BlockingIncrement",
                    "counter",
                    "sleeps past its timeout before incrementing",
                    RiskLevel::Low,
                    true,
                    BlastRadius::Single,
                ),
                context: MutationContext::new(Mode::Commit, Actor::unknown()),
            }
        }
    }

    impl Mutation<Counter> for BlockingIncrement {
        fn intent(&self) -> &Intent {
            &self.intent
        }
        fn context(&self) -> &MutationContext {
            &self.context
        }
        fn validate(&self, _state: &Counter) -> ValidationResult {
            ValidationResult::valid()
        }
        fn simulate(&self, state: &Counter) -> Result<ApplyOutcome<Counter>, MutationError> {
            self.apply(state)
        }
        fn apply(&self, state: &Counter) -> Result<ApplyOutcome<Counter>, MutationError> {
            std::thread::sleep(std::time::Duration::from_millis(50));
            Ok(ApplyOutcome::new(Counter(state.0 + 1), ChangeSet::new()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_raises_engine_error_and_audits_without_history() {
        let mut options = MutationEngineOptions::default();
        options.execution_timeout_ms = 10;
        let engine: MutationEngine<Counter> = MutationEngine::new(options);
        let mutation = BlockingIncrement::new();
        let state = Counter(10);
        let result = engine.execute_single("counter-11", &mutation, &state, None).await;
        assert!(matches!(result, Err(EngineError::Timeout(configured, elapsed)) if configured == 10 && elapsed >= 10));
        assert!(engine.get_history("counter-11").is_empty());
        let trail = engine.get_audit_trail("counter-11");
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].outcome, AuditOutcome::ExecutionFailed);
        assert!(trail[0].exception_message.is_some());
    }
}
