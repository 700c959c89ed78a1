//! Capability-keyed registry of bounded agent pools.
//!
//! Capabilities are resolved once, when the registry is built, into
//! [`AgentPool`]s that carry the agent and a semaphore bounding its
//! concurrency across every session sharing the registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::info;

use super::Agent;
use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// A registered capability with its concurrency bound.
pub struct AgentPool {
    capability: String,
    agent: Arc<dyn Agent>,
    max_concurrency: usize,
    permits: Arc<Semaphore>,
}

impl AgentPool {
    fn new(capability: String, agent: Arc<dyn Agent>, max_concurrency: usize) -> Self {
        Self {
            capability,
            agent,
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    /// Capability name served by this pool.
    #[must_use]
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Configured maximum simultaneous invocations.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Shared handle to the agent.
    #[must_use]
    pub fn agent(&self) -> Arc<dyn Agent> {
        Arc::clone(&self.agent)
    }

    /// Semaphore bounding invocations of this capability.
    #[must_use]
    pub fn permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.permits)
    }

    /// Whether the agent reports itself healthy.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.agent.is_available()
    }
}

/// Immutable mapping of capability name to [`AgentPool`].
pub struct AgentRegistry {
    pools: BTreeMap<String, Arc<AgentPool>>,
}

impl AgentRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    /// Pool serving `capability`, if registered.
    #[must_use]
    pub fn pool(&self, capability: &str) -> Option<Arc<AgentPool>> {
        self.pools.get(capability).cloned()
    }

    /// Registered capability names, sorted.
    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether no capability is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Builder collecting capability registrations.
#[derive(Default)]
pub struct AgentRegistryBuilder {
    entries: Vec<(String, Arc<dyn Agent>, usize)>,
}

impl AgentRegistryBuilder {
    /// Register `agent` for `capability` with an explicit concurrency bound.
    #[must_use]
    pub fn register(
        mut self,
        capability: impl Into<String>,
        agent: Arc<dyn Agent>,
        max_concurrency: usize,
    ) -> Self {
        self.entries.push((capability.into(), agent, max_concurrency));
        self
    }

    /// Register `agent` using the concurrency configured for `capability`.
    #[must_use]
    pub fn register_configured(
        self,
        config: &GlobalConfig,
        capability: impl Into<String>,
        agent: Arc<dyn Agent>,
    ) -> Self {
        let capability = capability.into();
        let limit = config.concurrency_for(&capability);
        self.register(capability, agent, limit)
    }

    /// Validate registrations and build the registry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for a duplicate capability or a zero
    /// concurrency bound.
    pub fn build(self) -> Result<AgentRegistry> {
        let mut pools = BTreeMap::new();
        for (capability, agent, max_concurrency) in self.entries {
            if max_concurrency == 0 {
                return Err(AppError::Config(format!(
                    "capability {capability} must allow at least one concurrent task"
                )));
            }
            if pools.contains_key(&capability) {
                return Err(AppError::Config(format!(
                    "capability {capability} registered twice"
                )));
            }
            info!(capability = %capability, max_concurrency, "agent capability registered");
            let pool = AgentPool::new(capability.clone(), agent, max_concurrency);
            pools.insert(capability, Arc::new(pool));
        }
        Ok(AgentRegistry { pools })
    }
}
