//! File-based storage backend.
//!
//! Each record lives in its own file under `<storage_path>/<namespace>/<id>.bin`.
//! Writes go to a temporary file that is renamed into place, so readers never
//! observe a partial record. Conditional writes hold an exclusive advisory lock
//! on a sibling `.lock` file for the duration of the read-compare-write, which
//! serializes them across threads and processes sharing the directory.

use crate::{StorageError, StorageFactory, StorageInterface, StorageRegistry};
use async_trait::async_trait;
use fs2::FileExt;
use orderflow_types::{
	ConfigSchema, Field, FieldType, ImplementationRegistry, Schema, ValidationError,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

/// Fixed-size header written in front of every record.
///
/// Binary layout (32 bytes total):
/// - [0-3]: Magic bytes "ORFL"
/// - [4-5]: Version (u16, little-endian)
/// - [6-13]: Write timestamp (u64, little-endian, Unix seconds)
/// - [14-31]: Reserved
#[derive(Debug, Clone)]
struct FileHeader {
	version: u16,
	written_at: u64,
}

impl FileHeader {
	const MAGIC: &'static [u8; 4] = b"ORFL";
	const VERSION: u16 = 1;
	const SIZE: usize = 32;

	fn now() -> Self {
		let written_at = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or_default();
		Self {
			version: Self::VERSION,
			written_at,
		}
	}

	fn serialize(&self) -> [u8; Self::SIZE] {
		let mut bytes = [0u8; Self::SIZE];
		bytes[0..4].copy_from_slice(Self::MAGIC);
		bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
		bytes[6..14].copy_from_slice(&self.written_at.to_le_bytes());
		bytes
	}

	/// Parses a header. Returns `None` for files written without one.
	fn deserialize(bytes: &[u8]) -> Result<Option<Self>, StorageError> {
		if bytes.len() < Self::SIZE || &bytes[0..4] != Self::MAGIC {
			return Ok(None);
		}

		let version = u16::from_le_bytes([bytes[4], bytes[5]]);
		if version > Self::VERSION {
			return Err(StorageError::Backend(format!(
				"Unsupported file version: {}",
				version
			)));
		}

		let mut written_bytes = [0u8; 8];
		written_bytes.copy_from_slice(&bytes[6..14]);

		Ok(Some(Self {
			version,
			written_at: u64::from_le_bytes(written_bytes),
		}))
	}
}

/// Strips the header from raw file contents.
fn payload(data: Vec<u8>) -> Result<Vec<u8>, StorageError> {
	match FileHeader::deserialize(&data)? {
		Some(_) => Ok(data[FileHeader::SIZE..].to_vec()),
		None => Ok(data),
	}
}

fn backend_err(e: impl std::fmt::Display) -> StorageError {
	StorageError::Backend(e.to_string())
}

/// Reads the payload stored at `path`, `None` if the file does not exist.
fn read_payload_sync(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
	match std::fs::read(path) {
		Ok(data) => payload(data).map(Some),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(backend_err(e)),
	}
}

/// Writes header and payload to a temporary file and renames it into place.
fn write_payload_sync(path: &Path, value: &[u8]) -> Result<(), StorageError> {
	let mut file_data = Vec::with_capacity(FileHeader::SIZE + value.len());
	file_data.extend_from_slice(&FileHeader::now().serialize());
	file_data.extend_from_slice(value);

	let temp_path = path.with_extension("tmp");
	std::fs::write(&temp_path, file_data).map_err(backend_err)?;
	std::fs::rename(&temp_path, path).map_err(backend_err)
}

/// Runs `f` while holding an exclusive lock on `lock_path`.
fn with_lock<R>(
	lock_path: &Path,
	f: impl FnOnce() -> Result<R, StorageError>,
) -> Result<R, StorageError> {
	if let Some(parent) = lock_path.parent() {
		std::fs::create_dir_all(parent).map_err(backend_err)?;
	}
	let lock = OpenOptions::new()
		.create(true)
		.truncate(false)
		.read(true)
		.write(true)
		.open(lock_path)
		.map_err(backend_err)?;
	FileExt::lock_exclusive(&lock).map_err(backend_err)?;
	let result = f();
	if let Err(e) = FileExt::unlock(&lock) {
		tracing::warn!("Failed to release lock {:?}: {}", lock_path, e);
	}
	result
}

/// Location of a record and its lock file.
#[derive(Debug, Clone)]
struct RecordPaths {
	data: PathBuf,
	lock: PathBuf,
}

/// File-based storage implementation.
pub struct FileStorage {
	base_path: PathBuf,
}

impl FileStorage {
	pub fn new(base_path: PathBuf) -> Self {
		Self { base_path }
	}

	/// Maps `namespace:id` to its files. Path separators in the id are
	/// replaced so every record stays inside its namespace directory.
	fn paths(&self, key: &str) -> RecordPaths {
		let (namespace, id) = key.split_once(':').unwrap_or(("default", key));
		let safe_id = id.replace(['/', '\\', ':'], "_");
		let dir = self.base_path.join(namespace);
		RecordPaths {
			data: dir.join(format!("{}.bin", safe_id)),
			lock: dir.join(format!("{}.lock", safe_id)),
		}
	}

	async fn blocking<R, F>(f: F) -> Result<R, StorageError>
	where
		F: FnOnce() -> Result<R, StorageError> + Send + 'static,
		R: Send + 'static,
	{
		tokio::task::spawn_blocking(f).await.map_err(backend_err)?
	}
}

#[async_trait]
impl StorageInterface for FileStorage {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		let path = self.paths(key).data;
		match fs::read(&path).await {
			Ok(data) => payload(data),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
			Err(e) => Err(backend_err(e)),
		}
	}

	async fn compare_and_swap(
		&self,
		key: &str,
		expected: Option<Vec<u8>>,
		value: Vec<u8>,
	) -> Result<(), StorageError> {
		let paths = self.paths(key);
		let key = key.to_string();
		Self::blocking(move || {
			with_lock(&paths.lock, || {
				if read_payload_sync(&paths.data)? != expected {
					return Err(StorageError::Conflict(key));
				}
				write_payload_sync(&paths.data, &value)
			})
		})
		.await
	}

	async fn list_keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
		let dir = self.base_path.join(namespace);
		let mut entries = match fs::read_dir(&dir).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(e) => return Err(backend_err(e)),
		};

		let mut keys = Vec::new();
		while let Some(entry) = entries.next_entry().await.map_err(backend_err)? {
			let path = entry.path();
			if path.extension() != Some(std::ffi::OsStr::new("bin")) {
				continue;
			}
			match path.file_stem().and_then(|stem| stem.to_str()) {
				Some(id) => keys.push(format!("{}:{}", namespace, id)),
				None => tracing::debug!("Skipping file with non UTF-8 name {:?}", path),
			}
		}
		Ok(keys)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(FileStorageSchema)
	}
}

/// Configuration schema for FileStorage.
pub struct FileStorageSchema;

impl ConfigSchema for FileStorageSchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![],
			vec![
				Field::new("storage_path", FieldType::String).with_validator(|value| {
					match value.as_str() {
						Some(path) if path.trim().is_empty() => {
							Err("storage_path cannot be empty".to_string())
						},
						_ => Ok(()),
					}
				}),
			],
		);
		schema.validate(config)
	}
}

/// Factory function to create a file storage backend from configuration.
///
/// Configuration parameters:
/// - `storage_path`: Base directory for record files (default: "./data/storage")
pub fn create_storage(config: &toml::Value) -> Result<Box<dyn StorageInterface>, StorageError> {
	FileStorageSchema
		.validate(config)
		.map_err(|e| StorageError::Configuration(e.to_string()))?;

	let storage_path = config
		.get("storage_path")
		.and_then(|v| v.as_str())
		.unwrap_or("./data/storage");

	Ok(Box::new(FileStorage::new(PathBuf::from(storage_path))))
}

/// Registry for the file storage implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "file";
	type Factory = StorageFactory;

	fn factory() -> Self::Factory {
		create_storage
	}
}

impl StorageRegistry for Registry {}
