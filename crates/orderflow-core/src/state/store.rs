//! Durable order records.
//!
//! Each order is stored together with its history and statistics as one
//! [`OrderRecord`]. Every change goes through [`OrderStore::update`], which
//! reads the record, lets the caller validate and mutate it, and writes it
//! back with a compare-and-swap against the bytes that were read. When
//! another writer got there first the whole read-validate-write cycle runs
//! again on the fresh record, so a change is either applied on top of the
//! latest state or rejected by the caller's own checks.

use crate::clock::Clock;
use crate::WorkflowError;
use chrono::{DateTime, Datelike, Utc};
use orderflow_storage::{StorageError, StorageService};
use orderflow_types::{
	truncate_id, Order, OrderHistoryEntry, OrderRecord, OrderStatus, StorageKey, WorkStatistic,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Attempts before a contended compare-and-swap is reported as unavailable.
pub(crate) const MAX_CONFLICT_RETRIES: usize = 32;

/// Last order number handed out in a year.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequenceCounter {
	year: i32,
	last: u32,
}

/// Maps a backend failure to the caller-facing error.
pub(crate) fn storage_error(err: StorageError) -> WorkflowError {
	WorkflowError::StorageUnavailable(err.to_string())
}

/// Typed access to order records.
pub struct OrderStore {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
}

impl OrderStore {
	pub fn new(storage: Arc<StorageService>, clock: Arc<dyn Clock>) -> Self {
		Self { storage, clock }
	}

	pub fn storage(&self) -> &Arc<StorageService> {
		&self.storage
	}

	pub fn now(&self) -> DateTime<Utc> {
		self.clock.now()
	}

	pub async fn get(&self, order_id: &str) -> Result<Order, WorkflowError> {
		self.record(order_id).await.map(|record| record.order)
	}

	/// Audit trail of an order, oldest first.
	pub async fn history(&self, order_id: &str) -> Result<Vec<OrderHistoryEntry>, WorkflowError> {
		self.record(order_id).await.map(|record| record.history)
	}

	pub async fn statistics(&self, order_id: &str) -> Result<Vec<WorkStatistic>, WorkflowError> {
		self.record(order_id).await.map(|record| record.statistics)
	}

	pub async fn record(&self, order_id: &str) -> Result<OrderRecord, WorkflowError> {
		match self
			.storage
			.retrieve(StorageKey::Orders.as_str(), order_id)
			.await
		{
			Ok(record) => Ok(record),
			Err(StorageError::NotFound) => Err(WorkflowError::NotFound(order_id.to_string())),
			Err(e) => Err(storage_error(e)),
		}
	}

	/// Orders currently in any of `statuses`, oldest first.
	pub async fn list_by_status(
		&self,
		statuses: &[OrderStatus],
	) -> Result<Vec<Order>, WorkflowError> {
		let records: Vec<(String, OrderRecord)> = self
			.storage
			.retrieve_all(StorageKey::Orders.as_str())
			.await
			.map_err(storage_error)?;

		let mut orders: Vec<Order> = records
			.into_iter()
			.map(|(_, record)| record.order)
			.filter(|order| statuses.contains(&order.status))
			.collect();
		orders.sort_by(|a, b| {
			a.created_at
				.cmp(&b.created_at)
				.then_with(|| a.order_number.cmp(&b.order_number))
		});
		Ok(orders)
	}

	/// Stores a new record. Fails if the id is already taken.
	pub(crate) async fn insert(&self, record: &OrderRecord) -> Result<(), WorkflowError> {
		self.storage
			.swap(StorageKey::Orders.as_str(), &record.order.id, None, record)
			.await
			.map(|_| ())
			.map_err(storage_error)
	}

	/// Applies `change` to the latest version of a record and persists it.
	///
	/// `change` may run several times and must decide from the record it is
	/// given alone. An error from `change` aborts without writing. When
	/// `change` leaves the record as it was nothing is written.
	pub(crate) async fn update<T, F>(
		&self,
		order_id: &str,
		mut change: F,
	) -> Result<(OrderRecord, T), WorkflowError>
	where
		F: FnMut(&mut OrderRecord) -> Result<T, WorkflowError>,
	{
		let orders = StorageKey::Orders.as_str();
		for attempt in 1..=MAX_CONFLICT_RETRIES {
			let current = self
				.storage
				.try_retrieve_stamped::<OrderRecord>(orders, order_id)
				.await
				.map_err(storage_error)?
				.ok_or_else(|| WorkflowError::NotFound(order_id.to_string()))?;

			let mut next = current.value.clone();
			let output = change(&mut next)?;
			if next == current.value {
				return Ok((next, output));
			}

			match self
				.storage
				.swap(orders, order_id, Some(&current), &next)
				.await
			{
				Ok(_) => return Ok((next, output)),
				Err(StorageError::Conflict(_)) => {
					tracing::debug!(
						order_id = %truncate_id(order_id),
						attempt,
						"Concurrent update detected, retrying"
					);
				},
				Err(e) => return Err(storage_error(e)),
			}
		}

		Err(WorkflowError::StorageUnavailable(format!(
			"order {} is under heavy contention",
			order_id
		)))
	}

	/// Allocates the next order number for the current year, e.g. `ZL-2026-0042`.
	pub(crate) async fn next_order_number(&self, prefix: &str) -> Result<String, WorkflowError> {
		let year = self.now().year();
		let id = year.to_string();
		let sequences = StorageKey::Sequences.as_str();

		for _ in 0..MAX_CONFLICT_RETRIES {
			let current = self
				.storage
				.try_retrieve_stamped::<SequenceCounter>(sequences, &id)
				.await
				.map_err(storage_error)?;
			let next = SequenceCounter {
				year,
				last: current.as_ref().map_or(0, |c| c.value.last) + 1,
			};

			match self
				.storage
				.swap(sequences, &id, current.as_ref(), &next)
				.await
			{
				Ok(_) => return Ok(format!("{}-{}-{:04}", prefix, year, next.last)),
				Err(StorageError::Conflict(_)) => continue,
				Err(e) => return Err(storage_error(e)),
			}
		}

		Err(WorkflowError::StorageUnavailable(
			"order number sequence is under heavy contention".into(),
		))
	}
}
