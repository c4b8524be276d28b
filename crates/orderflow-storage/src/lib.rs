//! Storage module for the orderflow system.
//!
//! This module provides abstractions for persistent storage of workflow
//! records. Backends implement a small byte-level key-value interface with a
//! compare-and-swap primitive; [`StorageService`] layers typed JSON access on
//! top of it. Read-modify-write atomicity for a record is obtained by reading
//! a [`Stamped`] value and swapping it against exactly the bytes that were
//! read.

use async_trait::async_trait;
use orderflow_types::{ConfigSchema, ImplementationRegistry};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Re-export implementations
pub mod implementations {
	pub mod file;
	pub mod memory;
}

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
	/// The requested item does not exist.
	#[error("Not found")]
	NotFound,
	/// A compare-and-swap found a different value than expected.
	#[error("Conflicting concurrent update for key {0}")]
	Conflict(String),
	/// Serialization or deserialization failed.
	#[error("Serialization error: {0}")]
	Serialization(String),
	/// The storage backend failed.
	#[error("Backend error: {0}")]
	Backend(String),
	/// The backend configuration is invalid.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

/// Low-level interface for storage backends.
///
/// Keys have the form `namespace:id`.
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait StorageInterface: Send + Sync {
	/// Retrieves raw bytes for the given key.
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError>;

	/// Atomically replaces the value at `key` with `value` if the current
	/// value equals `expected`. `None` means the key must not exist yet.
	///
	/// Returns [`StorageError::Conflict`] when the current value differs.
	async fn compare_and_swap(
		&self,
		key: &str,
		expected: Option<Vec<u8>>,
		value: Vec<u8>,
	) -> Result<(), StorageError>;

	/// Lists all keys in a namespace, in unspecified order.
	async fn list_keys(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

/// Signature every storage implementation's factory provides.
pub type StorageFactory = fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>;

/// Registry trait for storage implementations.
pub trait StorageRegistry: ImplementationRegistry<Factory = StorageFactory> {}

/// Returns all registered storage implementations as `(name, factory)` pairs.
pub fn get_all_implementations() -> Vec<(&'static str, StorageFactory)> {
	use implementations::{file, memory};

	vec![
		(file::Registry::NAME, file::Registry::factory()),
		(memory::Registry::NAME, memory::Registry::factory()),
	]
}

/// A deserialized value together with the exact bytes it was read from.
///
/// Passing it back to [`StorageService::swap`] makes the write conditional on
/// nobody having changed the record in between.
#[derive(Debug, Clone)]
pub struct Stamped<T> {
	pub value: T,
	raw: Vec<u8>,
}

impl<T> Stamped<T> {
	pub fn into_inner(self) -> T {
		self.value
	}
}

/// High-level storage service that provides typed operations.
///
/// Wraps a backend and serializes values as JSON under `namespace:id` keys.
pub struct StorageService {
	backend: Box<dyn StorageInterface>,
}

fn key(namespace: &str, id: &str) -> String {
	format!("{}:{}", namespace, id)
}

fn to_bytes<T: Serialize>(data: &T) -> Result<Vec<u8>, StorageError> {
	serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
	serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl StorageService {
	/// Creates a new StorageService with the specified backend.
	pub fn new(backend: Box<dyn StorageInterface>) -> Self {
		Self { backend }
	}

	/// Retrieves and deserializes a value.
	pub async fn retrieve<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<T, StorageError> {
		self.retrieve_stamped(namespace, id)
			.await
			.map(Stamped::into_inner)
	}

	/// Retrieves a value along with the bytes needed for a later [`swap`].
	///
	/// [`swap`]: StorageService::swap
	pub async fn retrieve_stamped<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Stamped<T>, StorageError> {
		let raw = self.backend.get_bytes(&key(namespace, id)).await?;
		let value = from_bytes(&raw)?;
		Ok(Stamped { value, raw })
	}

	/// Like [`retrieve_stamped`] but maps a missing key to `None`.
	///
	/// [`retrieve_stamped`]: StorageService::retrieve_stamped
	pub async fn try_retrieve_stamped<T: DeserializeOwned>(
		&self,
		namespace: &str,
		id: &str,
	) -> Result<Option<Stamped<T>>, StorageError> {
		match self.retrieve_stamped(namespace, id).await {
			Ok(stamped) => Ok(Some(stamped)),
			Err(StorageError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	/// Writes `next` only if the stored value is still `current`.
	///
	/// With `current = None` the write only succeeds if the key is absent.
	/// Fails with [`StorageError::Conflict`] otherwise.
	pub async fn swap<T: Serialize>(
		&self,
		namespace: &str,
		id: &str,
		current: Option<&Stamped<T>>,
		next: &T,
	) -> Result<Stamped<T>, StorageError>
	where
		T: Clone,
	{
		let raw = to_bytes(next)?;
		self.backend
			.compare_and_swap(
				&key(namespace, id),
				current.map(|stamped| stamped.raw.clone()),
				raw.clone(),
			)
			.await?;
		Ok(Stamped {
			value: next.clone(),
			raw,
		})
	}

	/// Retrieves every value in a namespace as `(id, value)` pairs.
	///
	/// Keys removed between listing and reading are skipped.
	pub async fn retrieve_all<T: DeserializeOwned>(
		&self,
		namespace: &str,
	) -> Result<Vec<(String, T)>, StorageError> {
		let prefix = format!("{}:", namespace);
		let mut results = Vec::new();
		for full_key in self.backend.list_keys(namespace).await? {
			let Some(id) = full_key.strip_prefix(&prefix) else {
				continue;
			};
			match self.backend.get_bytes(&full_key).await {
				Ok(bytes) => results.push((id.to_string(), from_bytes(&bytes)?)),
				Err(StorageError::NotFound) => continue,
				Err(e) => return Err(e),
			}
		}
		Ok(results)
	}
}
