//! Cooperative timeout and cancellation, isolated to the execute phase.
//!
//! Validation and policy evaluation are assumed fast and pure and are
//! never subject to a timeout or to cancellation; only the `apply`/
//! `simulate` call itself is wrapped here (spec §4.2).

use mutation_core::{ApplyOutcome, Mode, Mutation};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised by the execute phase. Distinct from validation/policy
/// outcomes, which are folded into `MutationResult` instead of raised.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// `apply`/`simulate` did not complete within the configured timeout.
    /// Carries the configured timeout and the actual elapsed time, both
    /// in milliseconds.
    #[error("execution timed out after {1}ms (configured {0}ms)")]
    Timeout(u64, u64),
    /// The caller cancelled the execution before or during the execute
    /// phase.
    #[error("execution cancelled")]
    Cancelled,
    /// `apply`/`simulate` returned an error.
    #[error("execution failed: {0}")]
    Failed(String),
}

/// Cooperative cancellation signal shared between a caller and the
/// executor. Checked at the two points where cancellation is observable:
/// immediately before the execute phase starts, and immediately after it
/// completes (a `Mutation::apply` call itself cannot be preempted
/// mid-flight since it is synchronous).
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A token that is not yet cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs the execute phase of one mutation against one state under a
/// timeout and an optional cancellation token.
pub struct Executor {
    timeout_ms: u64,
}

impl Executor {
    /// Build an executor enforcing `timeout_ms` on every call to `run`.
    pub fn new(timeout_ms: u64) -> Self {
        Self { timeout_ms }
    }

    /// Run `mutation`'s `apply` (or `simulate`, for [`Mode::Simulate`])
    /// against `state`, subject to the configured timeout and, if given,
    /// `cancellation`.
    ///
    /// `apply`/`simulate` are plain synchronous functions, not futures —
    /// they cannot yield mid-call, so a `tokio::time::timeout` raced
    /// against them directly would never fire (the single poll that runs
    /// the call to completion returns `Ready` before the race is ever
    /// evaluated). Instead the call runs on a scoped worker thread while
    /// this one waits on a channel with `recv_timeout`, so the raised
    /// [`ExecutorError::Timeout`] correctly reports that the deadline
    /// passed (spec §5: "awaiting executor apply ... runs on caller's
    /// thread/task"). Note this bounds *detection*, not *return*: `run`
    /// does not resolve until the worker thread exits, so a `apply` that
    /// never returns (rather than merely running long) still blocks this
    /// call indefinitely.
    pub async fn run<S>(
        &self,
        mutation: &dyn Mutation<S>,
        state: &S,
        mode: Mode,
        cancellation: Option<&CancellationToken>,
    ) -> Result<ApplyOutcome<S>, ExecutorError>
    where
        S: Sync,
        ApplyOutcome<S>: Send,
    {
        if cancellation.is_some_and(CancellationToken::is_cancelled) {
            return Err(ExecutorError::Cancelled);
        }

        let timeout = Duration::from_millis(self.timeout_ms);
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();
        let recv = std::thread::scope(|scope| {
            scope.spawn(|| {
                let outcome = match mode {
                    Mode::Simulate => mutation.simulate(state),
                    _ => mutation.apply(state),
                };
                let _ = tx.send(outcome);
            });
            rx.recv_timeout(timeout)
        });

        let outcome = match recv {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(ExecutorError::Failed(e.to_string())),
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                return Err(ExecutorError::Timeout(self.timeout_ms, elapsed_ms));
            }
        };

        if cancellation.is_some_and(CancellationToken::is_cancelled) {
            return Err(ExecutorError::Cancelled);
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutation_core::{
        BlastRadius, ChangeSet, Intent, Mode as CoreMode, MutationContext, MutationError,
        RiskLevel, ValidationResult,
    };

    struct Slow;

    impl Mutation<i32> for Slow {
        fn intent(&self) -> &Intent {
            static INTENT: std::sync::OnceLock<Intent> = std::sync::OnceLock::new();
            INTENT.get_or_init(|| {
                Intent::new("Slow", "test", "sleeps", RiskLevel::Low, true, BlastRadius::Single)
            })
        }
        fn context(&self) -> &MutationContext {
            static CTX: std::sync::OnceLock<MutationContext> = std::sync::OnceLock::new();
            CTX.get_or_init(|| MutationContext::new(CoreMode::Commit, mutation_core::Actor::unknown()))
        }
        fn validate(&self, _state: &i32) -> ValidationResult {
            ValidationResult::valid()
        }
        fn simulate(&self, state: &i32) -> Result<ApplyOutcome<i32>, MutationError> {
            self.apply(state)
        }
        fn apply(&self, state: &i32) -> Result<ApplyOutcome<i32>, MutationError> {
            Ok(ApplyOutcome::new(*state + 1, ChangeSet::new()))
        }
    }

    struct Failing;

    impl Mutation<i32> for Failing {
        fn intent(&self) -> &Intent {
            static INTENT: std::sync::OnceLock<Intent> = std::sync::OnceLock::new();
            INTENT.get_or_init(|| {
                Intent::new("Failing", "test", "always errors", RiskLevel::Low, true, BlastRadius::Single)
            })
        }
        fn context(&self) -> &MutationContext {
            static CTX: std::sync::OnceLock<MutationContext> = std::sync::OnceLock::new();
            CTX.get_or_init(|| MutationContext::new(CoreMode::Commit, mutation_core::Actor::unknown()))
        }
        fn validate(&self, _state: &i32) -> ValidationResult {
            ValidationResult::valid()
        }
        fn simulate(&self, state: &i32) -> Result<ApplyOutcome<i32>, MutationError> {
            self.apply(state)
        }
        fn apply(&self, _state: &i32) -> Result<ApplyOutcome<i32>, MutationError> {
            Err(MutationError::new("boom"))
        }
    }

    #[tokio::test]
    async fn successful_apply_returns_outcome() {
        let executor = Executor::new(1_000);
        let m = Slow;
        let outcome = executor.run(&m, &1, CoreMode::Commit, None).await.unwrap();
        assert_eq!(outcome.new_state, 2);
    }

    #[tokio::test]
    async fn pre_cancelled_token_short_circuits() {
        let executor = Executor::new(1_000);
        let m = Slow;
        let token = CancellationToken::new();
        token.cancel();
        let result = executor.run(&m, &1, CoreMode::Commit, Some(&token)).await;
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
    }

    #[tokio::test]
    async fn apply_error_is_wrapped_as_failed() {
        let executor = Executor::new(1_000);
        let m = Failing;
        let result = executor.run(&m, &1, CoreMode::Commit, None).await;
        assert!(matches!(result, Err(ExecutorError::Failed(_))));
    }

    struct Blocking;

    impl Mutation<i32> for Blocking {
        fn intent(&self) -> &Intent {
            static INTENT: std::sync::OnceLock<Intent> = std::sync::OnceLock::new();
            INTENT.get_or_init(|| {
                Intent::new("Blocking", "test", "sleeps past its timeout", RiskLevel::Low, true, BlastRadius::Single)
            })
        }
        fn context(&self) -> &MutationContext {
            static CTX: std::sync::OnceLock<MutationContext> = std::sync::OnceLock::new();
            CTX.get_or_init(|| MutationContext::new(CoreMode::Commit, mutation_core::Actor::unknown()))
        }
        fn validate(&self, _state: &i32) -> ValidationResult {
            ValidationResult::valid()
        }
        fn simulate(&self, state: &i32) -> Result<ApplyOutcome<i32>, MutationError> {
            self.apply(state)
        }
        fn apply(&self, state: &i32) -> Result<ApplyOutcome<i32>, MutationError> {
            std::thread::sleep(Duration::from_millis(50));
            Ok(ApplyOutcome::new(*state + 1, ChangeSet::new()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_apply_raises_timeout() {
        let executor = Executor::new(10);
        let m = Blocking;
        let started = std::time::Instant::now();
        let result = executor.run(&m, &1, CoreMode::Commit, None).await;
        assert!(matches!(result, Err(ExecutorError::Timeout(configured, elapsed)) if configured == 10 && elapsed >= 10));
        assert!(started.elapsed().as_millis() >= 10);
    }
}
