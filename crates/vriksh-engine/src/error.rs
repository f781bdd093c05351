use thiserror::Error;
use vriksh_spec::SpecError;
use vriksh_store::StoreError;
use vriksh_substrate::SubstrateError;

/// Failure taxonomy for the orchestrator. Variants raised before a run id
/// exists surface directly to the caller; everything later is funneled
/// through the teardown path and captured in the run context and ledger.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("execution substrate unreachable (is the docker daemon running?)")]
    SubstrateUnreachable,
    #[error("unknown provider type '{provider_type}' declared by provider '{provider_id}'")]
    UnknownProviderType {
        provider_id: String,
        provider_type: String,
    },
    #[error("provisioning failed for provider '{provider_id}': {detail}")]
    Provision { provider_id: String, detail: String },
    #[error("initialization failed for provider '{provider_id}': {detail}")]
    Setup { provider_id: String, detail: String },
    #[error("run aborted while ready: {0}")]
    Aborted(String),
    #[error(transparent)]
    Ledger(#[from] StoreError),
    #[error(transparent)]
    Substrate(#[from] SubstrateError),
}

/// Scoring failures never fail a run; the orchestrator records them and
/// degrades the score to 0.
#[derive(Debug, Error)]
#[error("scoring failed: {0}")]
pub struct ScoringError(pub String);
