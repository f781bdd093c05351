//! Provider contract and the type registry the orchestrator resolves
//! through. Adding a resource category means implementing [`Provider`] and
//! adding one [`Registry::register`] call; the orchestrator itself never
//! names a provider type.

use crate::fsm::RunContext;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use vriksh_spec::ProviderConfig;
use vriksh_substrate::Substrate;

pub trait Provider {
    /// Stands up the provider's resource. On success, metadata (resource
    /// handle, connection info) must be emitted into
    /// `ctx.provider_state[config.id]`.
    fn init(
        &self,
        config: &ProviderConfig,
        substrate: &dyn Substrate,
        ctx: &mut RunContext,
    ) -> Result<()>;

    /// Post-provision setup hook, run once per provider during the
    /// `initializing` phase. Default: nothing to do.
    fn setup(&self, _provider_id: &str, _substrate: &dyn Substrate, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Best-effort teardown. The default stops the resource recorded at
    /// init; the orchestrator catches and logs errors, never propagates
    /// them.
    fn teardown(
        &self,
        provider_id: &str,
        substrate: &dyn Substrate,
        ctx: &RunContext,
    ) -> Result<()> {
        let handle = ctx
            .provider_state
            .get(provider_id)
            .ok_or_else(|| anyhow!("no recorded resource for provider '{}'", provider_id))?;
        substrate.stop_resource(&handle.resource_id)?;
        Ok(())
    }
}

pub type ProviderFactory = fn() -> Box<dyn Provider>;

#[derive(Default)]
pub struct Registry {
    factories: BTreeMap<String, ProviderFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider_type: &str, factory: ProviderFactory) {
        self.factories.insert(provider_type.to_string(), factory);
    }

    pub fn resolve(&self, provider_type: &str) -> Option<Box<dyn Provider>> {
        self.factories.get(provider_type).map(|factory| factory())
    }

    pub fn contains(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Provider for Nop {
        fn init(
            &self,
            _config: &ProviderConfig,
            _substrate: &dyn Substrate,
            _ctx: &mut RunContext,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn registry_resolves_registered_types_only() {
        let mut registry = Registry::new();
        registry.register("nop", || Box::new(Nop));
        assert!(registry.contains("nop"));
        assert!(registry.resolve("nop").is_some());
        assert!(registry.resolve("gitlab").is_none());
    }
}
