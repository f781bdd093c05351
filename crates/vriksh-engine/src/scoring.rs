//! Scoring collaborator seam. The concrete check strategy (HTTP probes in
//! `vriksh-scoring`) stays outside the orchestrator; from here a scorer is
//! just "a number for a run id, or an error we degrade to 0".

use crate::error::ScoringError;

pub trait Scorer {
    fn evaluate(&self, run_id: &str) -> Result<u32, ScoringError>;
}

/// Scorer for labs without scoring configuration.
pub struct NullScorer;

impl Scorer for NullScorer {
    fn evaluate(&self, _run_id: &str) -> Result<u32, ScoringError> {
        Ok(0)
    }
}
