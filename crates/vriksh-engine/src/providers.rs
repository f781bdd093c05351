//! Built-in providers and the default registry.

use crate::fsm::{ProviderHandle, RunContext};
use crate::provider::{Provider, Registry};
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use vriksh_spec::ProviderConfig;
use vriksh_substrate::{StartRequest, Substrate};

const GITLAB_DEFAULT_IMAGE: &str = "gitlab/gitlab-ce:latest";
const GITLAB_DEFAULT_HOST_PORT: &str = "8923";
const GITLAB_HTTP_PORT: &str = "80";
const GITLAB_DEFAULT_ROOT_PASSWORD: &str = "vriksh123";

/// Hosted GitLab instance backed by one container on the run's shared
/// network. Config keys (all optional): `image`, `host_port`,
/// `root_password`.
pub struct GitLabProvider;

impl GitLabProvider {
    fn image(config: &ProviderConfig) -> String {
        config_str(config, "image").unwrap_or_else(|| GITLAB_DEFAULT_IMAGE.to_string())
    }

    fn host_port(config: &ProviderConfig) -> String {
        config_str(config, "host_port").unwrap_or_else(|| GITLAB_DEFAULT_HOST_PORT.to_string())
    }

    fn root_password(config: &ProviderConfig) -> String {
        config_str(config, "root_password")
            .unwrap_or_else(|| GITLAB_DEFAULT_ROOT_PASSWORD.to_string())
    }
}

impl Provider for GitLabProvider {
    fn init(
        &self,
        config: &ProviderConfig,
        substrate: &dyn Substrate,
        ctx: &mut RunContext,
    ) -> Result<()> {
        let host_port = Self::host_port(config);
        let root_password = Self::root_password(config);
        let mut ports = BTreeMap::new();
        ports.insert(host_port.clone(), GITLAB_HTTP_PORT.to_string());

        tracing::info!(provider = %config.id, "starting gitlab container");
        let started = substrate.start_resource(&StartRequest {
            run_id: ctx.run_id.clone(),
            image: Self::image(config),
            name: config.id.clone(),
            env: vec![(
                "GITLAB_ROOT_PASSWORD".to_string(),
                root_password.clone(),
            )],
            ports,
        })?;

        let url = format!("http://localhost:{}", host_port);
        ctx.provider_state.insert(
            config.id.clone(),
            ProviderHandle {
                resource_id: started.resource_id,
                metadata: json!({
                    "url": url,
                    "credentials": { "username": "root", "password": root_password },
                    "ports": started.port_mappings,
                }),
            },
        );
        Ok(())
    }
}

fn config_str(config: &ProviderConfig, key: &str) -> Option<String> {
    match config.config.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Registry with every provider type this build ships.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register("gitlab", || Box::new(GitLabProvider));
    registry
}
