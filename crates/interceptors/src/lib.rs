//! Mutation engine interceptor pipeline.
//!
//! An [`Interceptor`] observes a mutation's lifecycle without being able to
//! change its outcome: `on_before` runs ahead of policy evaluation,
//! `on_after` runs after a committed/simulated success, `on_policy_blocked`
//! runs when the effective policy decision denies, and `on_failed` runs on
//! validation failure or an execution error. Interceptors are invoked in
//! ascending `order`, tie-broken by registration order, against a
//! snapshot of the registry taken at the start of each execution so that
//! concurrent registration never reorders an in-flight run (spec §4.4).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mutation_core::{Mutation, MutationError, MutationResult, PolicyDecision};
use std::sync::{Arc, RwLock};

/// Lifecycle observer over a mutation's execution.
///
/// All hooks default to no-ops so implementations only override the
/// phases they care about.
pub trait Interceptor<S>: Send + Sync {
    /// Unique name within a pipeline.
    fn name(&self) -> &str;

    /// Ascending run order; lower runs first. Default 0.
    fn order(&self) -> i32 {
        0
    }

    /// Whether this interceptor applies to `mutation` at all. Evaluated
    /// once per phase invocation; an interceptor that returns `false` is
    /// skipped for that call.
    fn should_run(&self, _mutation: &dyn Mutation<S>) -> bool {
        true
    }

    /// Runs before policy evaluation and execution.
    fn on_before(&self, _mutation: &dyn Mutation<S>, _state: &S) {}

    /// Runs after a successful execution (commit or simulate).
    fn on_after(&self, _mutation: &dyn Mutation<S>, _result: &MutationResult<S>) {}

    /// Runs when validation fails or execution raises an error.
    fn on_failed(&self, _mutation: &dyn Mutation<S>, _error: &MutationError) {}

    /// Runs when the effective policy decision denies the mutation.
    fn on_policy_blocked(&self, _mutation: &dyn Mutation<S>, _decision: &PolicyDecision) {}
}

struct Entry<S> {
    interceptor: Arc<dyn Interceptor<S>>,
    registration_order: u64,
}

/// Thread-safe, ordered registry of interceptors for one state type.
pub struct InterceptorPipeline<S> {
    entries: RwLock<Vec<Entry<S>>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl<S> Default for InterceptorPipeline<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> InterceptorPipeline<S> {
    /// An empty pipeline.
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()), next_seq: std::sync::atomic::AtomicU64::new(0) }
    }

    /// Register an interceptor, giving it registration-order precedence
    /// among peers sharing its `order`.
    pub fn register(&self, interceptor: Arc<dyn Interceptor<S>>) {
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut w = self.entries.write().expect("interceptor pipeline lock poisoned");
        w.push(Entry { interceptor, registration_order: seq });
    }

    /// Remove the interceptor with the given name, if registered.
    pub fn unregister(&self, name: &str) {
        let mut w = self.entries.write().expect("interceptor pipeline lock poisoned");
        w.retain(|e| e.interceptor.name() != name);
    }

    /// A stable, ordered snapshot of every registered interceptor.
    ///
    /// Take this once per execution before invoking any phase, so that a
    /// registration happening mid-execution cannot be observed partway
    /// through.
    pub fn snapshot(&self) -> Vec<Arc<dyn Interceptor<S>>> {
        let r = self.entries.read().expect("interceptor pipeline lock poisoned");
        let mut sorted: Vec<&Entry<S>> = r.iter().collect();
        sorted.sort_by(|a, b| {
            a.interceptor
                .order()
                .cmp(&b.interceptor.order())
                .then(a.registration_order.cmp(&b.registration_order))
        });
        sorted.into_iter().map(|e| e.interceptor.clone()).collect()
    }

    /// Invoke `on_before` for every applicable interceptor in `snapshot`.
    pub fn run_before(snapshot: &[Arc<dyn Interceptor<S>>], mutation: &dyn Mutation<S>, state: &S) {
        for i in snapshot {
            if i.should_run(mutation) {
                i.on_before(mutation, state);
            }
        }
    }

    /// Invoke `on_after` for every applicable interceptor in `snapshot`.
    pub fn run_after(
        snapshot: &[Arc<dyn Interceptor<S>>],
        mutation: &dyn Mutation<S>,
        result: &MutationResult<S>,
    ) {
        for i in snapshot {
            if i.should_run(mutation) {
                i.on_after(mutation, result);
            }
        }
    }

    /// Invoke `on_failed` for every applicable interceptor in `snapshot`.
    pub fn run_failed(
        snapshot: &[Arc<dyn Interceptor<S>>],
        mutation: &dyn Mutation<S>,
        error: &MutationError,
    ) {
        for i in snapshot {
            if i.should_run(mutation) {
                i.on_failed(mutation, error);
            }
        }
    }

    /// Invoke `on_policy_blocked` for every applicable interceptor in
    /// `snapshot`.
    pub fn run_policy_blocked(
        snapshot: &[Arc<dyn Interceptor<S>>],
        mutation: &dyn Mutation<S>,
        decision: &PolicyDecision,
    ) {
        for i in snapshot {
            if i.should_run(mutation) {
                i.on_policy_blocked(mutation, decision);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutation_core::{
        ApplyOutcome, BlastRadius, ChangeSet, Intent, Mode, MutationContext, RiskLevel,
        ValidationResult,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct NoopMutation {
        intent: Intent,
        context: MutationContext,
    }

    impl NoopMutation {
        fn new() -> Self {
            Self {
                intent: Intent::new(
                    "Noop",
                    "test",
                    "does nothing",
                    RiskLevel::Low,
                    true,
                    BlastRadius::Single,
                ),
                context: MutationContext::new(Mode::Commit, mutation_core::Actor::unknown()),
            }
        }
    }

    impl Mutation<i32> for NoopMutation {
        fn intent(&self) -> &Intent {
            &self.intent
        }
        fn context(&self) -> &MutationContext {
            &self.context
        }
        fn validate(&self, _state: &i32) -> ValidationResult {
            ValidationResult::valid()
        }
        fn simulate(&self, state: &i32) -> Result<ApplyOutcome<i32>, MutationError> {
            self.apply(state)
        }
        fn apply(&self, state: &i32) -> Result<ApplyOutcome<i32>, MutationError> {
            Ok(ApplyOutcome::new(*state, ChangeSet::new()))
        }
    }

    struct Recorder {
        name: &'static str,
        order: i32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Interceptor<i32> for Recorder {
        fn name(&self) -> &str {
            self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        fn on_before(&self, _mutation: &dyn Mutation<i32>, _state: &i32) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    #[test]
    fn runs_in_ascending_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline: InterceptorPipeline<i32> = InterceptorPipeline::new();
        pipeline.register(Arc::new(Recorder { name: "second", order: 10, log: log.clone() }));
        pipeline.register(Arc::new(Recorder { name: "first", order: 1, log: log.clone() }));
        let snap = pipeline.snapshot();
        let m = NoopMutation::new();
        InterceptorPipeline::run_before(&snap, &m, &0);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn equal_order_breaks_tie_by_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline: InterceptorPipeline<i32> = InterceptorPipeline::new();
        pipeline.register(Arc::new(Recorder { name: "a", order: 5, log: log.clone() }));
        pipeline.register(Arc::new(Recorder { name: "b", order: 5, log: log.clone() }));
        let snap = pipeline.snapshot();
        let m = NoopMutation::new();
        InterceptorPipeline::run_before(&snap, &m, &0);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    struct Selective {
        ran: AtomicUsize,
    }

    impl Interceptor<i32> for Selective {
        fn name(&self) -> &str {
            "selective"
        }
        fn should_run(&self, mutation: &dyn Mutation<i32>) -> bool {
            mutation.intent().operation == "Relevant"
        }
        fn on_before(&self, _mutation: &dyn Mutation<i32>, _state: &i32) {
            self.ran.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn should_run_filters_out_irrelevant_mutations() {
        let pipeline: InterceptorPipeline<i32> = InterceptorPipeline::new();
        let interceptor = Arc::new(Selective { ran: AtomicUsize::new(0) });
        pipeline.register(interceptor.clone());
        let snap = pipeline.snapshot();
        let m = NoopMutation::new();
        InterceptorPipeline::run_before(&snap, &m, &0);
        assert_eq!(interceptor.ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unregister_removes_interceptor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline: InterceptorPipeline<i32> = InterceptorPipeline::new();
        pipeline.register(Arc::new(Recorder { name: "temp", order: 0, log }));
        assert_eq!(pipeline.snapshot().len(), 1);
        pipeline.unregister("temp");
        assert!(pipeline.snapshot().is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// For any sequence of registered `order` values, `snapshot()`
            /// is sorted ascending by `order` with ties broken by
            /// registration order (spec §4.4: "ascending order, registration
            /// tie-break").
            #[test]
            fn snapshot_is_sorted_by_order_then_registration(
                orders in prop::collection::vec(-20i32..20, 1..12),
            ) {
                const NAMES: [&str; 12] = [
                    "i0", "i1", "i2", "i3", "i4", "i5", "i6", "i7", "i8", "i9", "i10", "i11",
                ];
                let log = Arc::new(Mutex::new(Vec::new()));
                let pipeline: InterceptorPipeline<i32> = InterceptorPipeline::new();
                for (i, o) in orders.iter().enumerate() {
                    pipeline.register(Arc::new(Recorder { name: NAMES[i], order: *o, log: log.clone() }));
                }
                let snap = pipeline.snapshot();
                for window in snap.windows(2) {
                    prop_assert!(window[0].order() <= window[1].order());
                }
                let registration_index = |name: &str| NAMES.iter().position(|n| *n == name).unwrap();
                let mut last_seen: std::collections::HashMap<i32, usize> = std::collections::HashMap::new();
                for interceptor in &snap {
                    let idx = registration_index(interceptor.name());
                    if let Some(&prev_idx) = last_seen.get(&interceptor.order()) {
                        prop_assert!(prev_idx < idx);
                    }
                    last_seen.insert(interceptor.order(), idx);
                }
            }
        }
    }
}
