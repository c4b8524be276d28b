//! Configuration builder for creating test and development configurations.

use crate::{Config, RetryConfig, ServiceConfig, StorageConfig, WorkflowConfig};
use std::collections::HashMap;

/// Builder for creating `Config` instances with a fluent API.
///
/// Defaults to the in-memory backend and a short retry budget.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
	service_id: String,
	claim_timeout_seconds: u64,
	sweep_interval_seconds: u64,
	order_number_prefix: String,
	retry: RetryConfig,
	storage_primary: String,
	storage_implementations: HashMap<String, toml::Value>,
}

impl Default for ConfigBuilder {
	fn default() -> Self {
		Self::new()
	}
}

impl ConfigBuilder {
	pub fn new() -> Self {
		let mut storage_implementations = HashMap::new();
		storage_implementations.insert(
			"memory".to_string(),
			toml::Value::Table(toml::Table::new()),
		);
		Self {
			service_id: "orderflow-test".to_string(),
			claim_timeout_seconds: 7200,
			sweep_interval_seconds: 60,
			order_number_prefix: "ZL".to_string(),
			retry: RetryConfig {
				initial_interval_ms: 10,
				max_interval_seconds: 1,
				max_elapsed_seconds: 1,
			},
			storage_primary: "memory".to_string(),
			storage_implementations,
		}
	}

	pub fn service_id(mut self, id: impl Into<String>) -> Self {
		self.service_id = id.into();
		self
	}

	pub fn claim_timeout_seconds(mut self, seconds: u64) -> Self {
		self.claim_timeout_seconds = seconds;
		self
	}

	pub fn sweep_interval_seconds(mut self, seconds: u64) -> Self {
		self.sweep_interval_seconds = seconds;
		self
	}

	pub fn order_number_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.order_number_prefix = prefix.into();
		self
	}

	pub fn retry(mut self, retry: RetryConfig) -> Self {
		self.retry = retry;
		self
	}

	/// Selects the primary storage implementation and its settings.
	pub fn storage(mut self, primary: impl Into<String>, settings: toml::Value) -> Self {
		let primary = primary.into();
		self.storage_implementations
			.insert(primary.clone(), settings);
		self.storage_primary = primary;
		self
	}

	pub fn build(self) -> Config {
		Config {
			service: ServiceConfig {
				id: self.service_id,
			},
			workflow: WorkflowConfig {
				claim_timeout_seconds: self.claim_timeout_seconds,
				sweep_interval_seconds: self.sweep_interval_seconds,
				order_number_prefix: self.order_number_prefix,
				retry: self.retry,
			},
			storage: StorageConfig {
				primary: self.storage_primary,
				implementations: self.storage_implementations,
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_builder_defaults_are_valid() {
		let config = ConfigBuilder::new().build();
		assert!(config.validate().is_ok());
		assert_eq!(config.storage.primary, "memory");
	}

	#[test]
	fn test_builder_storage_override() {
		let mut settings = toml::Table::new();
		settings.insert("storage_path".into(), toml::Value::String("/tmp/x".into()));
		let config = ConfigBuilder::new()
			.claim_timeout_seconds(30)
			.storage("file", toml::Value::Table(settings))
			.build();

		assert!(config.validate().is_ok());
		assert_eq!(config.storage.primary, "file");
		assert_eq!(config.workflow.claim_timeout_seconds, 30);
		assert!(config.storage.implementations.contains_key("memory"));
	}
}
