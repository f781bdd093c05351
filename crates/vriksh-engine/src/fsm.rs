//! The run lifecycle state machine: a tagged-union phase type plus explicit
//! success/failure transition functions.
//!
//! The central invariant lives here: once resources may exist (anything at
//! or past `provisioning`), every failure routes through `tearing_down`;
//! only the three pre-resource phases fail straight to `failed`.

use serde_json::Value;
use std::collections::BTreeMap;
use vriksh_spec::LabSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Parsing,
    Validating,
    Preparing,
    Provisioning,
    Initializing,
    Ready,
    Scoring,
    TearingDown,
    Completed,
    Failed,
}

impl RunPhase {
    /// Persisted status string; the ledger additionally uses the
    /// out-of-band marker `force_teardown`.
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Parsing => "parsing",
            RunPhase::Validating => "validating",
            RunPhase::Preparing => "preparing",
            RunPhase::Provisioning => "provisioning",
            RunPhase::Initializing => "initializing",
            RunPhase::Ready => "ready",
            RunPhase::Scoring => "scoring",
            RunPhase::TearingDown => "tearing_down",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed)
    }

    pub fn on_success(self) -> Option<RunPhase> {
        match self {
            RunPhase::Parsing => Some(RunPhase::Validating),
            RunPhase::Validating => Some(RunPhase::Preparing),
            RunPhase::Preparing => Some(RunPhase::Provisioning),
            RunPhase::Provisioning => Some(RunPhase::Initializing),
            RunPhase::Initializing => Some(RunPhase::Ready),
            RunPhase::Ready => Some(RunPhase::Scoring),
            RunPhase::Scoring => Some(RunPhase::TearingDown),
            RunPhase::TearingDown => Some(RunPhase::Completed),
            RunPhase::Completed | RunPhase::Failed => None,
        }
    }

    pub fn on_failure(self) -> Option<RunPhase> {
        match self {
            // No resources can exist yet; fail directly.
            RunPhase::Parsing | RunPhase::Validating | RunPhase::Preparing => {
                Some(RunPhase::Failed)
            }
            // Resources may exist; unwind first.
            RunPhase::Provisioning
            | RunPhase::Initializing
            | RunPhase::Ready
            | RunPhase::Scoring => Some(RunPhase::TearingDown),
            RunPhase::TearingDown => Some(RunPhase::Failed),
            RunPhase::Completed | RunPhase::Failed => None,
        }
    }
}

/// Metadata a provider emits into the run context on successful init.
#[derive(Debug, Clone)]
pub struct ProviderHandle {
    pub resource_id: String,
    pub metadata: Value,
}

/// Mutable state owned by exactly one in-flight run.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    pub spec: LabSpec,
    pub error: Option<String>,
    pub provider_state: BTreeMap<String, ProviderHandle>,
}

impl RunContext {
    pub fn new(run_id: String, spec: LabSpec) -> Self {
        Self {
            run_id,
            spec,
            error: None,
            provider_state: BTreeMap::new(),
        }
    }

    /// Records the first failure message; later, unrelated failures never
    /// overwrite it.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    /// Access metadata for everything provisioned so far, keyed by
    /// provider id.
    pub fn access_info(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .provider_state
            .iter()
            .map(|(id, handle)| (id.clone(), handle.metadata.clone()))
            .collect();
        Value::Object(map)
    }
}

/// Outcome of the `ready` wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadySignal {
    Finished,
    Abort(String),
}

/// The one place the lifecycle blocks on something external. The CLI
/// implementation waits for the learner; tests substitute fixed signals.
pub trait ReadyGate {
    fn wait(&self, ctx: &RunContext) -> ReadySignal;
}

/// Gate that finishes immediately (`vriksh run --no-wait`).
pub struct AutoFinish;

impl ReadyGate for AutoFinish {
    fn wait(&self, _ctx: &RunContext) -> ReadySignal {
        ReadySignal::Finished
    }
}
