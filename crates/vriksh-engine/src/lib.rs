//! Run lifecycle orchestrator.
//!
//! Owns the canonical state machine for a single run and guarantees every
//! code path ends in exactly one terminal state, with resources unwound
//! whenever a failure happens after they may exist. Collaborators (ledger,
//! substrate, scorer, provider registry) are injected; the orchestrator
//! holds no global state.

mod error;
mod fsm;
mod provider;
mod providers;
mod scoring;

pub use error::{EngineError, ScoringError};
pub use fsm::{AutoFinish, ProviderHandle, ReadyGate, ReadySignal, RunContext, RunPhase};
pub use provider::{Provider, ProviderFactory, Registry};
pub use providers::{default_registry, GitLabProvider};
pub use scoring::{NullScorer, Scorer};

use chrono::Utc;
use serde_json::json;
use std::path::Path;
use vriksh_spec::LabSpec;
use vriksh_store::{Ledger, StoreError};
use vriksh_substrate::Substrate;

/// Terminal report for one run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunPhase,
    pub score: Option<u32>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct ForceTeardownReport {
    pub run_id: String,
    pub stopped: usize,
    pub failed: usize,
}

pub struct Engine<'a> {
    ledger: &'a Ledger,
    substrate: &'a dyn Substrate,
    scorer: &'a dyn Scorer,
    registry: Registry,
}

impl<'a> Engine<'a> {
    pub fn new(
        ledger: &'a Ledger,
        substrate: &'a dyn Substrate,
        scorer: &'a dyn Scorer,
        registry: Registry,
    ) -> Self {
        Self {
            ledger,
            substrate,
            scorer,
            registry,
        }
    }

    /// Loads, validates and executes a lab file end-to-end.
    pub fn execute(&self, path: &Path, gate: &dyn ReadyGate) -> Result<RunOutcome, EngineError> {
        let spec = vriksh_spec::load(path)?;
        self.run(spec, gate)
    }

    /// Drives a parsed spec through the lifecycle.
    ///
    /// Failures before a run id exists (`validating`, `preparing`) surface
    /// as `Err` directly; once the ledger run record is created, failures
    /// are funneled through `tearing_down` and reported via the returned
    /// [`RunOutcome`] and the event log. Ledger write failures are the one
    /// exception: the event log is the audit trail, so losing it aborts
    /// the run loudly.
    pub fn run(&self, spec: LabSpec, gate: &dyn ReadyGate) -> Result<RunOutcome, EngineError> {
        // validating: pure semantic check, no side effects
        spec.validate_semantics()?;

        // preparing: confirm the substrate before committing to a run id
        if !self.substrate.check_reachable() {
            return Err(EngineError::SubstrateUnreachable);
        }
        let run_id = generate_run_id();
        self.ledger.create_run(&run_id, &spec.metadata.id)?;
        self.ledger.append_event(
            &run_id,
            "PREPARE",
            &format!("run prepared for lab '{}'", spec.metadata.id),
            None,
        )?;
        tracing::info!(run_id = %run_id, lab = %spec.metadata.id, "run prepared");

        let mut ctx = RunContext::new(run_id, spec);
        let mut score = None;
        let mut phase = RunPhase::Provisioning;
        while !phase.is_terminal() {
            self.enter_phase(&ctx, phase)?;
            let result = match phase {
                RunPhase::Provisioning => self.provision(&mut ctx),
                RunPhase::Initializing => self.initialize(&ctx),
                RunPhase::Ready => match gate.wait(&ctx) {
                    ReadySignal::Finished => Ok(()),
                    ReadySignal::Abort(message) => Err(EngineError::Aborted(message)),
                },
                RunPhase::Scoring => self.score(&ctx).map(|s| score = Some(s)),
                RunPhase::TearingDown => self.teardown(&ctx),
                RunPhase::Parsing
                | RunPhase::Validating
                | RunPhase::Preparing
                | RunPhase::Completed
                | RunPhase::Failed => Ok(()),
            };
            phase = match result {
                Ok(()) => match phase.on_success() {
                    Some(next) => next,
                    None => break,
                },
                Err(e) => {
                    let message = e.to_string();
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        phase = phase.as_str(),
                        error = %message,
                        "phase failed"
                    );
                    ctx.fail(message.clone());
                    self.ledger.append_event(&ctx.run_id, "ERROR", &message, None)?;
                    match phase.on_failure() {
                        Some(next) => next,
                        None => break,
                    }
                }
            };
        }
        self.finish(&ctx, phase, score)
    }

    fn enter_phase(&self, ctx: &RunContext, phase: RunPhase) -> Result<(), EngineError> {
        self.ledger.update_status(&ctx.run_id, phase.as_str())?;
        let (event_type, message) = match phase {
            RunPhase::Provisioning => ("PROVISION", "provisioning declared providers"),
            RunPhase::Initializing => ("INIT", "running initialization hooks"),
            RunPhase::Ready => ("READY", "lab is ready; waiting for the learner"),
            RunPhase::Scoring => ("SCORING", "running scoring checks"),
            RunPhase::TearingDown => ("TEARDOWN", "tearing down resources"),
            _ => return Ok(()),
        };
        let payload = (phase == RunPhase::Ready).then(|| ctx.access_info());
        self.ledger
            .append_event(&ctx.run_id, event_type, message, payload.as_ref())?;
        Ok(())
    }

    /// Providers in declared order; the first failure aborts the loop, so
    /// teardown may find only a prefix of them recorded.
    fn provision(&self, ctx: &mut RunContext) -> Result<(), EngineError> {
        let network = self.substrate.create_shared_network(&ctx.run_id)?;
        tracing::debug!(run_id = %ctx.run_id, network = %network, "shared network ready");
        let configs = ctx.spec.spec.topology.providers.clone();
        for config in &configs {
            let provider = self.registry.resolve(&config.provider_type).ok_or_else(|| {
                EngineError::UnknownProviderType {
                    provider_id: config.id.clone(),
                    provider_type: config.provider_type.clone(),
                }
            })?;
            provider
                .init(config, self.substrate, ctx)
                .map_err(|e| EngineError::Provision {
                    provider_id: config.id.clone(),
                    detail: e.to_string(),
                })?;
            let handle = ctx.provider_state.get(&config.id).ok_or_else(|| {
                EngineError::Provision {
                    provider_id: config.id.clone(),
                    detail: "init succeeded without emitting resource metadata".to_string(),
                }
            })?;
            self.ledger.add_provider_record(
                &ctx.run_id,
                &config.id,
                &config.provider_type,
                &handle.resource_id,
                &handle.metadata,
            )?;
            self.ledger.append_event(
                &ctx.run_id,
                "PROVIDER_READY",
                &format!("provider '{}' provisioned", config.id),
                Some(&handle.metadata),
            )?;
        }
        Ok(())
    }

    /// One atomic phase: the first setup error fails it as a whole.
    fn initialize(&self, ctx: &RunContext) -> Result<(), EngineError> {
        for record in self.ledger.list_providers(&ctx.run_id)? {
            let provider = match self.registry.resolve(&record.provider_type) {
                Some(provider) => provider,
                // A record only exists for a type that resolved during
                // provisioning.
                None => continue,
            };
            provider
                .setup(&record.provider_id, self.substrate, ctx)
                .map_err(|e| EngineError::Setup {
                    provider_id: record.provider_id.clone(),
                    detail: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn score(&self, ctx: &RunContext) -> Result<u32, EngineError> {
        match self.scorer.evaluate(&ctx.run_id) {
            Ok(score) => {
                self.ledger.append_event(
                    &ctx.run_id,
                    "SCORE",
                    &format!("final score: {}", score),
                    Some(&json!({ "score": score })),
                )?;
                Ok(score)
            }
            Err(e) => {
                tracing::warn!(run_id = %ctx.run_id, error = %e, "scoring degraded to 0");
                self.ledger
                    .append_event(&ctx.run_id, "SCORING_ERROR", &e.to_string(), None)?;
                Ok(0)
            }
        }
    }

    /// Tears down every provider that has a ledger record. Per-provider
    /// failures are logged and skipped; the shared network is removed once
    /// afterwards regardless of their outcomes.
    fn teardown(&self, ctx: &RunContext) -> Result<(), EngineError> {
        for record in self.ledger.list_providers(&ctx.run_id)? {
            let result = match self.registry.resolve(&record.provider_type) {
                Some(provider) => provider.teardown(&record.provider_id, self.substrate, ctx),
                None => Err(anyhow::anyhow!(
                    "unknown provider type '{}'",
                    record.provider_type
                )),
            };
            match result {
                Ok(()) => self.ledger.append_event(
                    &ctx.run_id,
                    "PROVIDER_STOPPED",
                    &format!("provider '{}' torn down", record.provider_id),
                    None,
                )?,
                Err(e) => {
                    tracing::warn!(
                        run_id = %ctx.run_id,
                        provider = %record.provider_id,
                        error = %e,
                        "provider teardown failed"
                    );
                    self.ledger.append_event(
                        &ctx.run_id,
                        "TEARDOWN_ERROR",
                        &format!("provider '{}': {}", record.provider_id, e),
                        None,
                    )?;
                }
            }
        }
        if let Err(e) = self.substrate.remove_shared_network(&ctx.run_id) {
            tracing::warn!(run_id = %ctx.run_id, error = %e, "shared network removal failed");
            self.ledger.append_event(
                &ctx.run_id,
                "TEARDOWN_ERROR",
                &format!("shared network: {}", e),
                None,
            )?;
        }
        Ok(())
    }

    fn finish(
        &self,
        ctx: &RunContext,
        phase: RunPhase,
        score: Option<u32>,
    ) -> Result<RunOutcome, EngineError> {
        self.ledger.update_status(&ctx.run_id, phase.as_str())?;
        match phase {
            RunPhase::Completed => {
                let payload = score.map(|s| json!({ "score": s }));
                self.ledger
                    .append_event(&ctx.run_id, "COMPLETED", "run completed", payload.as_ref())?;
            }
            RunPhase::Failed => {
                self.ledger.append_event(
                    &ctx.run_id,
                    "FAILED",
                    ctx.error.as_deref().unwrap_or("run failed"),
                    None,
                )?;
            }
            _ => {}
        }
        tracing::info!(
            run_id = %ctx.run_id,
            status = phase.as_str(),
            score = ?score,
            "run finished"
        );
        Ok(RunOutcome {
            run_id: ctx.run_id.clone(),
            status: phase,
            score,
            error: ctx.error.clone(),
        })
    }
}

/// Out-of-band teardown from ledger records alone, for `vriksh teardown`.
/// Needs no live run context: resource handles come from provider records
/// and the shared network name is derived from the run id.
pub fn force_teardown(
    ledger: &Ledger,
    substrate: &dyn Substrate,
    run_id: Option<&str>,
) -> Result<ForceTeardownReport, EngineError> {
    let run = match run_id {
        Some(id) => ledger
            .get_run(id)?
            .ok_or_else(|| StoreError::RunNotFound(id.to_string()))?,
        None => ledger.get_most_recent_run()?.ok_or(StoreError::Empty)?,
    };
    ledger.update_status(&run.id, "force_teardown")?;
    ledger.append_event(&run.id, "FORCE_TEARDOWN", "forced teardown requested", None)?;

    let mut stopped = 0;
    let mut failed = 0;
    for record in ledger.list_providers(&run.id)? {
        match substrate.stop_resource(&record.resource_id) {
            Ok(()) => {
                stopped += 1;
                ledger.append_event(
                    &run.id,
                    "PROVIDER_STOPPED",
                    &format!("provider '{}' torn down", record.provider_id),
                    None,
                )?;
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(
                    run_id = %run.id,
                    provider = %record.provider_id,
                    error = %e,
                    "forced provider teardown failed"
                );
                ledger.append_event(
                    &run.id,
                    "TEARDOWN_ERROR",
                    &format!("provider '{}': {}", record.provider_id, e),
                    None,
                )?;
            }
        }
    }
    if let Err(e) = substrate.remove_shared_network(&run.id) {
        failed += 1;
        ledger.append_event(
            &run.id,
            "TEARDOWN_ERROR",
            &format!("shared network: {}", e),
            None,
        )?;
    }

    let status = if failed == 0 { "completed" } else { "failed" };
    ledger.update_status(&run.id, status)?;
    ledger.append_event(
        &run.id,
        if failed == 0 { "COMPLETED" } else { "FAILED" },
        "forced teardown finished",
        Some(&json!({ "stopped": stopped, "failed": failed })),
    )?;
    Ok(ForceTeardownReport {
        run_id: run.id,
        stopped,
        failed,
    })
}

fn generate_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S_%3f"))
}
