//! Operational CLI driving the in-process mutation engine.
//!
//! This is a demo harness, not a persistence tool: every invocation
//! builds a fresh engine, registers the example flags policy and
//! interceptor, runs one canned scenario, and prints the requested view
//! of the resulting audit/history/metrics stores. There is no durable
//! backend to point this at (by design, see the workspace's Non-goals).

#![deny(unsafe_code)]

use clap::{Parser, Subcommand, ValueEnum};
use mutation_core::{
    ApplyOutcome, Actor, ActorType, BlastRadius, ChangeKind, Intent, Mode, Mutation,
    MutationContext, MutationError, PolicyDecision, RiskLevel, StateChange, ValidationIssue,
    ValidationResult,
};
use mutation_engine::{MutationEngine, MutationEngineOptions};
use policy::Policy;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const DEMO_STATE_ID: &str = "demo-flags";

#[derive(Parser, Debug)]
#[command(name = "mutation-cli", about = "Run demo scenarios against the mutation engine")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario and print its final result as JSON.
    Demo {
        #[arg(value_enum, default_value_t = Scenario::Basic)]
        scenario: Scenario,
    },
    /// Run a scenario then print the resulting history entries.
    History {
        #[arg(value_enum, default_value_t = Scenario::Basic)]
        scenario: Scenario,
    },
    /// Run a scenario then print per-state history statistics.
    Stats {
        #[arg(value_enum, default_value_t = Scenario::Basic)]
        scenario: Scenario,
    },
    /// Run a scenario then print engine-wide execution statistics.
    EngineStats {
        #[arg(value_enum, default_value_t = Scenario::Basic)]
        scenario: Scenario,
    },
    /// Run a scenario then print the full audit trail.
    Audit {
        #[arg(value_enum, default_value_t = Scenario::Basic)]
        scenario: Scenario,
    },
    /// Run a scenario then write its audit trail and history to a JSON
    /// file for offline inspection, the way a WAL gets dumped to a trace.
    Export {
        #[arg(value_enum, default_value_t = Scenario::Basic)]
        scenario: Scenario,
        #[arg(short, long)]
        out: std::path::PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Scenario {
    /// A single allowed flag enable.
    Basic,
    /// An enable blocked by the max-enabled-flags policy.
    PolicyDenied,
    /// An enable rejected at validation (empty flag name).
    ValidationFailure,
    /// Two enables run as one batch.
    Batch,
}

/// Example domain state: a small named set of boolean feature flags.
#[derive(Debug, Clone, Default, serde::Serialize)]
struct FlagsState {
    flags: BTreeMap<String, bool>,
}

/// Denies an `EnableFlag` mutation once more than `max_enabled` flags
/// would be set, the way a real deployment would cap blast radius.
struct MaxEnabledFlagsPolicy {
    max_enabled: usize,
}

impl Policy<FlagsState> for MaxEnabledFlagsPolicy {
    fn name(&self) -> &str {
        "MaxEnabledFlags"
    }
    fn priority(&self) -> i32 {
        100
    }
    fn evaluate(
        &self,
        _mutation: &dyn Mutation<FlagsState>,
        state: &FlagsState,
    ) -> PolicyDecision {
        let enabled = state.flags.values().filter(|v| **v).count();
        if enabled >= self.max_enabled {
            PolicyDecision::deny(
                "MaxEnabledFlags",
                format!("already at the cap of {} enabled flags", self.max_enabled),
            )
        } else {
            PolicyDecision::allow()
        }
    }
}

/// Logs each phase transition via `tracing`, the way a production
/// deployment would wire audit-adjacent observability without coupling
/// it to the auditor itself.
struct LoggingInterceptor;

impl interceptors::Interceptor<FlagsState> for LoggingInterceptor {
    fn name(&self) -> &str {
        "Logging"
    }
    fn on_before(&self, mutation: &dyn Mutation<FlagsState>, _state: &FlagsState) {
        tracing::info!(operation = %mutation.intent().operation, "before");
    }
    fn on_after(
        &self,
        mutation: &dyn Mutation<FlagsState>,
        result: &mutation_core::MutationResult<FlagsState>,
    ) {
        tracing::info!(operation = %mutation.intent().operation, changes = result.changes.len(), "after");
    }
    fn on_policy_blocked(&self, mutation: &dyn Mutation<FlagsState>, decision: &PolicyDecision) {
        tracing::warn!(operation = %mutation.intent().operation, reason = ?decision.reason, "policy blocked");
    }
}

struct EnableFlag {
    intent: Intent,
    context: MutationContext,
    flag: String,
}

impl EnableFlag {
    fn new(flag: impl Into<String>) -> Self {
        let flag = flag.into();
        Self {
            intent: Intent::new(
                "EnableFlag",
                "feature-flags",
                format!("enable flag `{flag}`"),
                RiskLevel::Medium,
                true,
                BlastRadius::Module,
            ),
            context: MutationContext::new(
                Mode::Commit,
                Actor::new("operator-1", "cli operator", ActorType::User),
            ),
            flag,
        }
    }
}

impl Mutation<FlagsState> for EnableFlag {
    fn intent(&self) -> &Intent {
        &self.intent
    }
    fn context(&self) -> &MutationContext {
        &self.context
    }
    fn validate(&self, _state: &FlagsState) -> ValidationResult {
        if self.flag.trim().is_empty() {
            return ValidationResult::valid().with_error(ValidationIssue::new(
                "flag",
                "flag name must not be empty",
                mutation_core::Severity::Error,
            ));
        }
        ValidationResult::valid()
    }
    fn simulate(&self, state: &FlagsState) -> Result<ApplyOutcome<FlagsState>, MutationError> {
        self.apply(state)
    }
    fn apply(&self, state: &FlagsState) -> Result<ApplyOutcome<FlagsState>, MutationError> {
        let mut next = state.clone();
        let before = next.flags.get(&self.flag).copied();
        next.flags.insert(self.flag.clone(), true);
        let mut changes = mutation_core::ChangeSet::new();
        changes.push(StateChange::new(
            format!("flags.{}", self.flag),
            before.map(|b| json!(b)),
            Some(json!(true)),
            if before.is_some() { ChangeKind::Modified } else { ChangeKind::Added },
        ));
        Ok(ApplyOutcome::new(next, changes))
    }
}

fn build_engine() -> MutationEngine<FlagsState> {
    let engine = MutationEngine::new(MutationEngineOptions::strict());
    engine.register_policy(Arc::new(MaxEnabledFlagsPolicy { max_enabled: 2 }));
    engine.register_interceptor(Arc::new(LoggingInterceptor));
    engine
}

async fn run_scenario(scenario: Scenario) -> (MutationEngine<FlagsState>, serde_json::Value) {
    let engine = build_engine();
    let state = match scenario {
        Scenario::PolicyDenied => {
            let mut flags = BTreeMap::new();
            flags.insert("a".to_string(), true);
            flags.insert("b".to_string(), true);
            FlagsState { flags }
        }
        _ => FlagsState::default(),
    };

    let rendered = match scenario {
        Scenario::Basic | Scenario::PolicyDenied => {
            let mutation = EnableFlag::new("dark-mode");
            let result = engine.execute_single(DEMO_STATE_ID, &mutation, &state, None).await;
            render_outcome(result)
        }
        Scenario::ValidationFailure => {
            let mutation = EnableFlag::new("");
            let result = engine.execute_single(DEMO_STATE_ID, &mutation, &state, None).await;
            render_outcome(result)
        }
        Scenario::Batch => {
            let m1 = EnableFlag::new("dark-mode");
            let m2 = EnableFlag::new("beta-search");
            let mutations: Vec<&dyn Mutation<FlagsState>> = vec![&m1, &m2];
            let result = engine.execute_batch(DEMO_STATE_ID, &mutations, &state, None).await;
            render_outcome(result)
        }
    };
    (engine, rendered)
}

/// Writes `{history, audit}` for `state_id` as pretty JSON to `path`,
/// the way `replay-cli`'s `to-trace` dumps a WAL slice to a file.
fn export_trace(
    engine: &MutationEngine<FlagsState>,
    state_id: &str,
    path: &Path,
) -> anyhow::Result<()> {
    let trace = json!({
        "history": engine.get_history(state_id),
        "audit": engine.get_audit_trail(state_id),
    });
    std::fs::write(path, serde_json::to_string_pretty(&trace)?)?;
    Ok(())
}

fn render_outcome<T: serde::Serialize>(
    result: Result<T, mutation_engine::EngineError>,
) -> serde_json::Value {
    match result {
        Ok(value) => serde_json::to_value(&value).unwrap_or(json!({"error": "unserializable"})),
        Err(e) => json!({"engine_error": e.to_string()}),
    }
}

#[tokio::main]
async fn main() {
    metrics::init_json_logging();
    let cli = Cli::parse();

    match cli.cmd {
        Command::Demo { scenario } => {
            let (_engine, result) = run_scenario(scenario).await;
            println!("{}", serde_json::to_string_pretty(&result).unwrap());
        }
        Command::History { scenario } => {
            let (engine, _) = run_scenario(scenario).await;
            let history = engine.get_history(DEMO_STATE_ID);
            println!("{}", serde_json::to_string_pretty(&history).unwrap());
        }
        Command::Stats { scenario } => {
            let (engine, _) = run_scenario(scenario).await;
            let stats = engine.get_history_statistics(DEMO_STATE_ID);
            println!("{}", serde_json::to_string_pretty(&stats).unwrap());
        }
        Command::EngineStats { scenario } => {
            let (engine, _) = run_scenario(scenario).await;
            let stats = engine.get_statistics();
            println!("{}", serde_json::to_string_pretty(&stats).unwrap());
        }
        Command::Audit { scenario } => {
            let (engine, _) = run_scenario(scenario).await;
            let trail = engine.get_audit_trail(DEMO_STATE_ID);
            println!("{}", serde_json::to_string_pretty(&trail).unwrap());
        }
        Command::Export { scenario, out } => {
            let (engine, _) = run_scenario(scenario).await;
            export_trace(&engine, DEMO_STATE_ID, &out).expect("failed to export trace");
            println!("wrote trace JSON to {:?}", out);
        }
    }
}
