//! Builder for constructing workflow engines.
//!
//! Composes a [`WorkflowEngine`] from configuration, a storage backend
//! created by one of the registered storage factories, and a clock.

use crate::clock::{Clock, SystemClock};
use crate::engine::WorkflowEngine;
use crate::state::OrderStore;
use orderflow_config::Config;
use orderflow_storage::{StorageError, StorageInterface, StorageService};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Builder for a [`WorkflowEngine`] with a pluggable storage backend.
pub struct WorkflowBuilder {
	config: Config,
	clock: Arc<dyn Clock>,
}

impl WorkflowBuilder {
	pub fn new(config: Config) -> Self {
		Self {
			config,
			clock: Arc::new(SystemClock),
		}
	}

	/// Replaces the wall clock used for claim and history timestamps.
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	/// Builds the engine, creating the primary storage backend from the
	/// matching factory.
	///
	/// Every configured implementation that has a factory is created so that
	/// a broken secondary configuration is reported at startup.
	pub fn build<SF>(
		self,
		storage_factories: HashMap<String, SF>,
	) -> Result<WorkflowEngine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
	{
		let mut storage_impls = HashMap::new();
		for (name, config) in &self.config.storage.implementations {
			let Some(factory) = storage_factories.get(name) else {
				tracing::warn!(
					component = "storage",
					implementation = %name,
					"No factory registered, skipping"
				);
				continue;
			};
			match factory(config) {
				Ok(implementation) => {
					let is_primary = &self.config.storage.primary == name;
					tracing::info!(
						component = "storage",
						implementation = %name,
						enabled = %is_primary,
						"Loaded"
					);
					storage_impls.insert(name.clone(), implementation);
				},
				Err(e) => {
					tracing::error!(
						component = "storage",
						implementation = %name,
						error = %e,
						"Failed to create storage implementation"
					);
					return Err(BuilderError::Config(format!(
						"Failed to create storage implementation '{}': {}",
						name, e
					)));
				},
			}
		}

		let primary = &self.config.storage.primary;
		let backend = storage_impls.remove(primary).ok_or_else(|| {
			BuilderError::MissingComponent(format!(
				"Primary storage '{}' has no registered implementation",
				primary
			))
		})?;

		Ok(self.build_with_backend(backend))
	}

	/// Builds the engine on an already constructed storage backend.
	pub fn build_with_backend(self, backend: Box<dyn StorageInterface>) -> WorkflowEngine {
		let storage = Arc::new(StorageService::new(backend));
		let store = Arc::new(OrderStore::new(storage, self.clock));
		WorkflowEngine::new(self.config, store)
	}
}
