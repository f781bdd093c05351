//! HTTP scoring checks for the `gitlab-ci-basics` lab family.
//!
//! Two probes against the provisioned GitLab instance:
//!   reachability of the sign-in page        -> 10 points
//!   a successful pipeline on root/ci-demo   -> 90 points
//!
//! The instance URL and API token come from the provider record the run
//! persisted during provisioning, so scoring needs nothing beyond the
//! ledger and the network.

use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;
use vriksh_engine::{Scorer, ScoringError};
use vriksh_store::Ledger;

const ALIVE_POINTS: u32 = 10;
const PIPELINE_POINTS: u32 = 90;
const SCORED_PROJECT: &str = "root%2Fci-demo";
const DEFAULT_TOKEN: &str = "private-token";
const ALIVE_TIMEOUT: Duration = Duration::from_secs(2);
const API_TIMEOUT: Duration = Duration::from_secs(3);

pub struct HttpScorer<'a> {
    ledger: &'a Ledger,
    client: Client,
}

impl<'a> HttpScorer<'a> {
    pub fn new(ledger: &'a Ledger) -> Result<Self, ScoringError> {
        let client = Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| ScoringError(format!("http client: {}", e)))?;
        Ok(Self { ledger, client })
    }

    /// A booting instance answers 502 through its bundled nginx before the
    /// application is up; only a 2xx sign-in page counts as alive.
    fn is_alive(&self, base_url: &str) -> bool {
        self.client
            .get(format!("{}/users/sign_in", base_url))
            .timeout(ALIVE_TIMEOUT)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }

    fn pipeline_succeeded(&self, base_url: &str, token: &str) -> bool {
        let response = match self
            .client
            .get(format!(
                "{}/api/v4/projects/{}/pipelines",
                base_url, SCORED_PROJECT
            ))
            .header("PRIVATE-TOKEN", token)
            .send()
        {
            Ok(response) => response,
            Err(_) => return false,
        };
        let status = response.status().as_u16();
        let body: Value = match response.json() {
            Ok(body) => body,
            Err(_) => return false,
        };
        pipeline_passed(status, &body)
    }
}

impl Scorer for HttpScorer<'_> {
    fn evaluate(&self, run_id: &str) -> Result<u32, ScoringError> {
        let providers = self
            .ledger
            .list_providers(run_id)
            .map_err(|e| ScoringError(e.to_string()))?;
        let gitlab = providers
            .iter()
            .find(|p| p.provider_type == "gitlab")
            .ok_or_else(|| ScoringError("no gitlab provider found to score".to_string()))?;
        let url = gitlab
            .metadata
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ScoringError(format!(
                    "provider '{}' has no url in its metadata",
                    gitlab.provider_id
                ))
            })?;
        let token = gitlab
            .metadata
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_TOKEN);

        tracing::info!(run_id, url, "checking gitlab reachability");
        if !self.is_alive(url) {
            tracing::warn!(run_id, url, "gitlab unreachable, remaining checks skipped");
            return Ok(0);
        }
        let mut score = ALIVE_POINTS;

        tracing::info!(run_id, "verifying pipeline status for {}", SCORED_PROJECT);
        if self.pipeline_succeeded(url, token) {
            score += PIPELINE_POINTS;
        } else {
            tracing::info!(run_id, "no successful pipeline found");
        }
        Ok(score)
    }
}

/// A 200 response whose body is a non-empty pipeline array with the most
/// recent pipeline in `success` earns the pipeline points.
pub fn pipeline_passed(status: u16, body: &Value) -> bool {
    if status != 200 {
        return false;
    }
    match body.as_array() {
        Some(pipelines) => {
            pipelines
                .first()
                .and_then(|p| p.get("status"))
                .and_then(Value::as_str)
                == Some("success")
        }
        None => false,
    }
}
