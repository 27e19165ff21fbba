//! Server assembly.
//!
//! [`ServerContext`] wires the pieces together at startup: operation
//! store, cancellation registry, system + user functions, the standard
//! extension set, and the request handler. There are no process-wide
//! singletons; everything hangs off this context.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::extensions::{self, CancelRegistry};
use crate::function::Function;
use crate::handler::RequestHandler;
use crate::operation::{spawn_sweeper, MemoryOperationStore, OperationStore};
use crate::pipeline::ExtensionRegistry;
use crate::registry::RegistryBuilder;
use crate::system::{register_system_functions, SystemState};

pub struct ServerContext {
    pub config: Config,
    pub handler: Arc<RequestHandler>,
    pub operations: Arc<dyn OperationStore>,
    pub system: Arc<SystemState>,
}

impl ServerContext {
    /// Build the full runtime: registries are frozen here, and every
    /// registration problem is a fatal startup error.
    pub fn initialize(config: Config, user_functions: Vec<Arc<dyn Function>>) -> Result<Self> {
        crate::config::validate(&config)?;

        let operations: Arc<dyn OperationStore> = Arc::new(MemoryOperationStore::new(
            Duration::from_secs(config.operations.ttl_seconds),
        ));
        let cancel_registry = Arc::new(CancelRegistry::new());
        let system = Arc::new(SystemState::new(&config, operations.clone()));

        let mut builder = RegistryBuilder::new(config.reserved.namespaces.clone());
        register_system_functions(&mut builder, system.clone(), cancel_registry.clone())
            .context("registering system functions")?;
        for function in user_functions {
            let urn = function.descriptor().urn.clone();
            builder
                .register(function)
                .with_context(|| format!("registering '{urn}'"))?;
        }
        let registry = Arc::new(builder.build());

        let extensions = Arc::new(
            ExtensionRegistry::build(extensions::standard(
                &config,
                cancel_registry,
                operations.clone(),
            ))
            .context("building extension registry")?,
        );
        system.attach(registry.clone(), extensions.clone());

        let handler = Arc::new(RequestHandler::new(&config, registry, extensions));
        tracing::info!(
            functions = handler.registry().len(),
            extensions = handler.extensions().len(),
            node = %handler.node_id(),
            "runtime initialized"
        );

        Ok(Self {
            config,
            handler,
            operations,
            system,
        })
    }

    /// Start the background operation-expiry sweeper.
    pub fn start_sweeper(&self) -> tokio::task::JoinHandle<()> {
        spawn_sweeper(
            self.operations.clone(),
            Duration::from_secs(self.config.operations.sweep_interval_seconds),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_with_defaults() {
        let ctx = ServerContext::initialize(Config::default(), Vec::new()).unwrap();
        // the system function set is present
        assert!(ctx.handler.registry().len() >= 8);
        assert!(ctx.handler.extensions().len() >= 10);
    }
}
