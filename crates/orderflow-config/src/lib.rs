//! Configuration module for the orderflow system.
//!
//! This module provides structures and utilities for managing service
//! configuration. It supports loading configuration from TOML files and
//! provides validation to ensure all required configuration values are
//! properly set.
//!
//! ## Modular Configuration Support
//!
//! Configurations can be split into multiple files:
//! - Use `include = ["file1.toml", "file2.toml"]` to include other config files
//! - Each top-level section must be unique across all files (no duplicates allowed)

#[cfg(any(test, feature = "testing"))]
pub mod builders;
mod loader;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Keep the message, not the echoed input
		ConfigError::Parse(err.message().to_string())
	}
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Identity of this service instance.
	pub service: ServiceConfig,
	/// Workflow timing and numbering.
	#[serde(default)]
	pub workflow: WorkflowConfig,
	/// Configuration for the storage backend.
	pub storage: StorageConfig,
}

/// Configuration specific to the service instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	/// Unique identifier for this instance, used in logs.
	pub id: String,
}

/// Workflow timing and numbering settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowConfig {
	/// Grace period before a claimed order reverts to its pool.
	#[serde(default = "default_claim_timeout_seconds")]
	pub claim_timeout_seconds: u64,
	/// How often overdue and unarmed claims are swept.
	#[serde(default = "default_sweep_interval_seconds")]
	pub sweep_interval_seconds: u64,
	/// Prefix of human readable order numbers.
	#[serde(default = "default_order_number_prefix")]
	pub order_number_prefix: String,
	/// Backoff applied when a timeout fire hits a storage error.
	#[serde(default)]
	pub retry: RetryConfig,
}

impl Default for WorkflowConfig {
	fn default() -> Self {
		Self {
			claim_timeout_seconds: default_claim_timeout_seconds(),
			sweep_interval_seconds: default_sweep_interval_seconds(),
			order_number_prefix: default_order_number_prefix(),
			retry: RetryConfig::default(),
		}
	}
}

impl WorkflowConfig {
	pub fn claim_timeout(&self) -> Duration {
		Duration::from_secs(self.claim_timeout_seconds)
	}

	pub fn sweep_interval(&self) -> Duration {
		Duration::from_secs(self.sweep_interval_seconds)
	}
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
	#[serde(default = "default_initial_interval_ms")]
	pub initial_interval_ms: u64,
	#[serde(default = "default_max_interval_seconds")]
	pub max_interval_seconds: u64,
	/// Total time spent retrying before giving up.
	#[serde(default = "default_max_elapsed_seconds")]
	pub max_elapsed_seconds: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			initial_interval_ms: default_initial_interval_ms(),
			max_interval_seconds: default_max_interval_seconds(),
			max_elapsed_seconds: default_max_elapsed_seconds(),
		}
	}
}

/// Two hours.
fn default_claim_timeout_seconds() -> u64 {
	7200
}

fn default_sweep_interval_seconds() -> u64 {
	60
}

fn default_order_number_prefix() -> String {
	"ZL".to_string()
}

fn default_initial_interval_ms() -> u64 {
	500
}

fn default_max_interval_seconds() -> u64 {
	30
}

fn default_max_elapsed_seconds() -> u64 {
	300
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
}

/// Resolves environment variables in a string.
///
/// Replaces ${VAR_NAME} with the value of the environment variable VAR_NAME.
/// Supports default values with ${VAR_NAME:-default_value}.
///
/// Input strings are limited to 1MB to keep regex matching bounded.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = String::with_capacity(input.len());
	let mut last_end = 0;

	for cap in re.captures_iter(input) {
		let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
			continue;
		};
		let value = match std::env::var(var_name.as_str()) {
			Ok(v) => v,
			Err(_) => match cap.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name.as_str()
					)));
				},
			},
		};

		result.push_str(&input[last_end..full_match.start()]);
		result.push_str(&value);
		last_end = full_match.end();
	}
	result.push_str(&input[last_end..]);

	Ok(result)
}

impl Config {
	/// Loads configuration from a file with environment variable resolution.
	///
	/// Supports `include = ["file1.toml", "file2.toml"]`; each top-level
	/// section must be unique across all configuration files.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let path_buf = Path::new(path);
		let base_dir = path_buf.parent().unwrap_or_else(|| Path::new("."));

		let mut loader = loader::ConfigLoader::new(base_dir);
		let file_name = path_buf
			.file_name()
			.ok_or_else(|| ConfigError::Validation(format!("Invalid path: {}", path)))?;
		loader.load_config(file_name).await
	}

	/// Validates the configuration to ensure all required fields are properly set.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.service.id.trim().is_empty() {
			return Err(ConfigError::Validation("Service ID cannot be empty".into()));
		}

		let workflow = &self.workflow;
		if workflow.claim_timeout_seconds == 0 {
			return Err(ConfigError::Validation(
				"claim_timeout_seconds must be greater than 0".into(),
			));
		}
		if workflow.claim_timeout_seconds > 604_800 {
			return Err(ConfigError::Validation(
				"claim_timeout_seconds cannot exceed 604800 (7 days)".into(),
			));
		}
		if workflow.sweep_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"sweep_interval_seconds must be greater than 0".into(),
			));
		}
		if workflow.sweep_interval_seconds > 86_400 {
			return Err(ConfigError::Validation(
				"sweep_interval_seconds cannot exceed 86400 (24 hours)".into(),
			));
		}
		if workflow.order_number_prefix.trim().is_empty() {
			return Err(ConfigError::Validation(
				"order_number_prefix cannot be empty".into(),
			));
		}
		if workflow.retry.initial_interval_ms == 0 {
			return Err(ConfigError::Validation(
				"retry.initial_interval_ms must be greater than 0".into(),
			));
		}
		if workflow.retry.max_interval_seconds * 1000 < workflow.retry.initial_interval_ms {
			return Err(ConfigError::Validation(
				"retry.max_interval_seconds must not be shorter than retry.initial_interval_ms"
					.into(),
			));
		}

		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if self.storage.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Storage primary implementation cannot be empty".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}

		Ok(())
	}
}

/// Parses a TOML string, resolving environment variables and validating the
/// result.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}
