//! Registry of storage backend factories.
//!
//! Every backend the storage crate ships is registered here under its
//! configuration name, so the backend is chosen from the config file alone.

use orderflow_config::Config;
use orderflow_core::{WorkflowBuilder, WorkflowEngine};
use orderflow_storage::StorageFactory;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Known implementation factories by name.
pub struct FactoryRegistry {
	pub storage: HashMap<String, StorageFactory>,
}

impl FactoryRegistry {
	pub fn new() -> Self {
		Self {
			storage: HashMap::new(),
		}
	}

	pub fn register_storage(&mut self, name: impl Into<String>, factory: StorageFactory) {
		self.storage.insert(name.into(), factory);
	}
}

static REGISTRY: OnceLock<FactoryRegistry> = OnceLock::new();

/// Returns the registry, filling it on first use.
pub fn get_registry() -> &'static FactoryRegistry {
	REGISTRY.get_or_init(|| {
		let mut registry = FactoryRegistry::new();
		for (name, factory) in orderflow_storage::get_all_implementations() {
			tracing::debug!("Registering storage implementation: {}", name);
			registry.register_storage(name, factory);
		}
		registry
	})
}

/// Builds the engine for `config`, failing on storage implementations the
/// registry does not know.
pub fn build_engine_from_config(
	config: Config,
) -> Result<WorkflowEngine, Box<dyn std::error::Error>> {
	let registry = get_registry();

	let mut storage_factories = HashMap::new();
	for name in config.storage.implementations.keys() {
		let Some(factory) = registry.storage.get(name) else {
			let mut available: Vec<_> = registry.storage.keys().cloned().collect();
			available.sort();
			return Err(format!(
				"Unknown storage implementation '{}'. Available: [{}]",
				name,
				available.join(", ")
			)
			.into());
		};
		storage_factories.insert(name.clone(), *factory);
	}

	Ok(WorkflowBuilder::new(config).build(storage_factories)?)
}
