//! Mutation governance policy registry and evaluator.
//!
//! A [`Policy`] is a named, prioritized, side-effect-free rule over a
//! mutation and the state it would apply to. The [`PolicyRegistry`] stores
//! policies per state type and keeps them ordered deterministically; the
//! free function [`evaluate`] folds an ordered set of decisions into the
//! single effective decision the engine acts on.
//!
//! Precedence and determinism (spec §4.1 step 3, §4.3):
//! 1. Policies run in descending `priority` order; equal priority breaks
//!    ties by registration order.
//! 2. The first decision that denies short-circuits evaluation — it is
//!    the effective decision.
//! 3. Otherwise, the first decision that carries `modifications`
//!    short-circuits evaluation and is the effective decision (still
//!    allowed).
//! 4. If every policy passes, the effective decision is a synthetic
//!    `Allow`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use mutation_core::{Mutation, PolicyDecision};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors raised while loading policy configuration.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Reading a priority-overrides file failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// The priority-overrides document did not parse.
    #[error("malformed policy priority overrides: {0}")]
    Malformed(#[from] serde_yaml::Error),
}

/// A named, prioritized governance rule producing a decision over a
/// mutation and state. Must be side-effect free (spec §3).
pub trait Policy<S>: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    /// Higher priority is evaluated first.
    fn priority(&self) -> i32;

    /// Optional human-readable description.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Evaluate this policy against `mutation` and `state`. Must not
    /// mutate `state` or produce side effects.
    fn evaluate(&self, mutation: &dyn Mutation<S>, state: &S) -> PolicyDecision;
}

/// Optional per-name priority overrides, loadable from a YAML document.
///
/// Grounded in the teacher's `Engine::load_from_yaml_path`: policy
/// *behavior* stays in Rust (`evaluate` remains code), but priority can be
/// retuned per-deployment without a recompile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyPriorityOverrides {
    /// Policy name to priority value.
    #[serde(default)]
    pub priorities: BTreeMap<String, i32>,
}

impl PolicyPriorityOverrides {
    /// Parse overrides from a YAML string of the form
    /// `priorities: { BusinessHours: 200 }`.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PolicyError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load overrides from a YAML file at `path`.
    pub fn load_from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self, PolicyError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }
}

struct OverriddenPolicy<S> {
    inner: Arc<dyn Policy<S>>,
    priority: i32,
}

impl<S> Policy<S> for OverriddenPolicy<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }
    fn priority(&self) -> i32 {
        self.priority
    }
    fn description(&self) -> Option<&str> {
        self.inner.description()
    }
    fn evaluate(&self, mutation: &dyn Mutation<S>, state: &S) -> PolicyDecision {
        self.inner.evaluate(mutation, state)
    }
}

struct Entry<S> {
    policy: Arc<dyn Policy<S>>,
    registration_order: u64,
}

/// Thread-safe, per-state-type store of registered policies.
///
/// Preserves registration order for deterministic tie-breaking when two
/// policies share a priority (spec §4.1 "Tie-breaks and ordering").
pub struct PolicyRegistry<S> {
    entries: RwLock<Vec<Entry<S>>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl<S> Default for PolicyRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> PolicyRegistry<S> {
    /// An empty registry.
    pub fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()), next_seq: std::sync::atomic::AtomicU64::new(0) }
    }

    /// Register a policy, giving it registration-order precedence among
    /// peers sharing its priority.
    pub fn register(&self, policy: Arc<dyn Policy<S>>) {
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut w = self.entries.write().expect("policy registry lock poisoned");
        w.push(Entry { policy, registration_order: seq });
    }

    /// Register a policy with its priority overridden by `overrides`, if
    /// present; otherwise behaves like [`register`](Self::register).
    pub fn register_with_overrides(
        &self,
        policy: Arc<dyn Policy<S>>,
        overrides: &PolicyPriorityOverrides,
    ) {
        if let Some(&priority) = overrides.priorities.get(policy.name()) {
            self.register(Arc::new(OverriddenPolicy { inner: policy, priority }));
        } else {
            self.register(policy);
        }
    }

    /// Remove the policy with the given name, if registered.
    pub fn unregister(&self, name: &str) {
        let mut w = self.entries.write().expect("policy registry lock poisoned");
        w.retain(|e| e.policy.name() != name);
    }

    /// All registered policies, ordered by descending priority, then
    /// registration order.
    pub fn get_policies(&self) -> Vec<Arc<dyn Policy<S>>> {
        let r = self.entries.read().expect("policy registry lock poisoned");
        let mut sorted: Vec<&Entry<S>> = r.iter().collect();
        sorted.sort_by(|a, b| {
            b.policy
                .priority()
                .cmp(&a.policy.priority())
                .then(a.registration_order.cmp(&b.registration_order))
        });
        sorted.into_iter().map(|e| e.policy.clone()).collect()
    }

    /// Look up a single policy by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Policy<S>>> {
        let r = self.entries.read().expect("policy registry lock poisoned");
        r.iter().find(|e| e.policy.name() == name).map(|e| e.policy.clone())
    }
}

/// Outcome of evaluating an ordered set of policies against one mutation.
pub struct EvaluationOutcome {
    /// The single decision the engine acts on.
    pub effective: PolicyDecision,
    /// Every decision actually computed, in evaluation order (for audit
    /// and the `evaluated_policies` metric).
    pub evaluated: Vec<PolicyDecision>,
}

/// Evaluate `policies` (already ordered by [`PolicyRegistry::get_policies`])
/// against `mutation` and `state`, producing the effective decision per
/// the precedence rules documented on this module.
pub fn evaluate<S>(
    policies: &[Arc<dyn Policy<S>>],
    mutation: &dyn Mutation<S>,
    state: &S,
) -> EvaluationOutcome {
    let mut evaluated = Vec::with_capacity(policies.len());
    for policy in policies {
        let decision = policy.evaluate(mutation, state);
        let short_circuit = !decision.is_allowed || decision.modifications.is_some();
        evaluated.push(decision.clone());
        if short_circuit {
            return EvaluationOutcome { effective: decision, evaluated };
        }
    }
    EvaluationOutcome { effective: PolicyDecision::allow(), evaluated }
}
