//! Claim coordination.
//!
//! A claim moves an order from a pool into processing for one worker. Two
//! rules hold for every claim: an order has at most one holder, and a worker
//! holds at most one order per role.
//!
//! The first rule is enforced by the order store's compare-and-swap: the
//! claim re-checks that the order is unheld and still pooled on the exact
//! version it writes over. The second is enforced with a per-worker slot
//! record in the `claims` namespace that names the order the worker holds.
//!
//! A claim reserves the slot with a fresh reservation token, writes the
//! order, then confirms the slot by clearing the token with another
//! compare-and-swap. A slot naming an order the worker does not hold may be
//! taken over, and that includes a reservation still in flight in another
//! process. The claim that loses its token fails to confirm and rolls its
//! order write back. Claims by the same worker within one process are
//! serialized so they never take over each other's reservations.

use crate::state::store::{storage_error, MAX_CONFLICT_RETRIES};
use crate::state::transitions::history_entry;
use crate::state::OrderStore;
use crate::WorkflowError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orderflow_storage::{Stamped, StorageError};
use orderflow_types::{
	truncate_id, Action, Order, OrderStatus, Role, Stage, StorageKey, WorkStatistic,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;

/// The order a worker is currently claiming in one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSlot {
	pub worker_id: String,
	pub role: Role,
	/// `None` once the claim has ended.
	pub order_id: Option<String>,
	/// Token of a claim that has reserved the slot but not yet confirmed it.
	#[serde(default)]
	pub reservation: Option<String>,
	pub updated_at: DateTime<Utc>,
}

fn slot_id(worker_id: &str, role: Role) -> String {
	format!("{}.{}", worker_id, role)
}

/// Rows a claim added to the order record, used to undo it.
struct ClaimRows {
	history_id: String,
	statistic_id: String,
	pooled_at: DateTime<Utc>,
}

enum Confirmation {
	Confirmed,
	/// The reservation was taken over; holds the order the slot names now.
	Lost(Option<String>),
}

/// Enforces the single-holder and single-active-order rules for claims.
pub struct ClaimCoordinator {
	store: Arc<OrderStore>,
	claim_timeout: chrono::Duration,
	worker_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ClaimCoordinator {
	pub fn new(store: Arc<OrderStore>, claim_timeout: chrono::Duration) -> Self {
		Self {
			store,
			claim_timeout,
			worker_locks: DashMap::new(),
		}
	}

	pub fn claim_timeout(&self) -> chrono::Duration {
		self.claim_timeout
	}

	/// Claims a pooled order for `worker_id` working as `role`.
	///
	/// On success the order is in the role's processing status, held by the
	/// worker, with `claimed_at` now and `timeout_at` one claim timeout later.
	/// Fails with `AlreadyClaimed` if another worker holds the order,
	/// `NotInPool` if the order is not waiting in the role's pool and
	/// `WorkerBusy` if the worker still holds another order in this role.
	#[instrument(
		skip_all,
		fields(order_id = %truncate_id(order_id), worker = %worker_id, role = %role)
	)]
	pub async fn try_claim(
		&self,
		order_id: &str,
		worker_id: &str,
		role: Role,
		notes: Option<String>,
	) -> Result<Order, WorkflowError> {
		let stage = role
			.stage()
			.ok_or_else(|| WorkflowError::Forbidden(format!("role '{}' cannot claim orders", role)))?;

		let lock = self.worker_lock(worker_id);
		let result = {
			let _guard = lock.lock().await;
			self.claim_locked(order_id, worker_id, role, stage, notes).await
		};
		drop(lock);
		self.prune_worker_lock(worker_id);
		result
	}

	async fn claim_locked(
		&self,
		order_id: &str,
		worker_id: &str,
		role: Role,
		stage: Stage,
		notes: Option<String>,
	) -> Result<Order, WorkflowError> {
		// Cheap rejection before touching the worker's slot.
		let order = self.store.get(order_id).await?;
		check_claimable(&order, stage.pool())?;

		let reservation = self.reserve_slot(worker_id, role, order_id).await?;
		self.claim_reserved(order_id, worker_id, role, stage, &reservation, notes)
			.await
	}

	/// Writes the claim onto the order and confirms the reserved slot,
	/// rolling the order back if the reservation was taken over meanwhile.
	async fn claim_reserved(
		&self,
		order_id: &str,
		worker_id: &str,
		role: Role,
		stage: Stage,
		reservation: &str,
		notes: Option<String>,
	) -> Result<Order, WorkflowError> {
		let (order, rows) = match self.write_claim(order_id, worker_id, role, stage, notes).await {
			Ok(claimed) => claimed,
			Err(e) => {
				self.release_reservation(worker_id, role, reservation).await;
				return Err(e);
			},
		};

		match self.confirm_slot(worker_id, role, reservation).await {
			Ok(Confirmation::Confirmed) => {
				tracing::info!(timeout_at = ?order.timeout_at, "Order claimed");
				Ok(order)
			},
			Ok(Confirmation::Lost(held)) => {
				tracing::warn!(
					held = ?held,
					"Claim slot taken over by a concurrent claim, rolling back"
				);
				self.roll_back(order_id, worker_id, stage, &rows).await;
				Err(match held {
					Some(held) => WorkflowError::WorkerBusy {
						worker_id: worker_id.to_string(),
						order_id: held,
					},
					None => WorkflowError::StorageUnavailable(format!(
						"claim slot for {} changed during the claim",
						worker_id
					)),
				})
			},
			Err(e) => {
				self.roll_back(order_id, worker_id, stage, &rows).await;
				self.release_reservation(worker_id, role, reservation).await;
				Err(e)
			},
		}
	}

	async fn write_claim(
		&self,
		order_id: &str,
		worker_id: &str,
		role: Role,
		stage: Stage,
		notes: Option<String>,
	) -> Result<(Order, ClaimRows), WorkflowError> {
		let claim_timeout = self.claim_timeout;
		let (record, rows) = self
			.store
			.update(order_id, |record| {
				check_claimable(&record.order, stage.pool())?;

				let now = self.store.now();
				let from = record.order.status;
				let processing = stage.processing();
				let pooled_at = record.order.updated_at;

				let order = &mut record.order;
				order.status = processing;
				order.current_holder = Some(worker_id.to_string());
				order.claimed_at = Some(now);
				order.timeout_at = Some(now + claim_timeout);
				order.updated_at = now;

				let entry = history_entry(
					order_id,
					from,
					processing,
					Action::Claim,
					Some(worker_id),
					notes.clone(),
					now,
				);
				let statistic = WorkStatistic {
					id: uuid::Uuid::new_v4().to_string(),
					worker_id: worker_id.to_string(),
					order_id: order_id.to_string(),
					role,
					stage,
					claimed_at: now,
					completed_at: None,
					duration_seconds: None,
					was_rejected: false,
					outcome: None,
				};
				let rows = ClaimRows {
					history_id: entry.id.clone(),
					statistic_id: statistic.id.clone(),
					pooled_at,
				};
				record.history.push(entry);
				record.statistics.push(statistic);
				Ok(rows)
			})
			.await?;
		Ok((record.order, rows))
	}

	/// Returns the order to its pool and drops the claim's rows, unless the
	/// claim has moved on in the meantime.
	async fn roll_back(&self, order_id: &str, worker_id: &str, stage: Stage, rows: &ClaimRows) {
		let result = self
			.store
			.update(order_id, |record| {
				let order = &record.order;
				let open = record
					.statistics
					.iter()
					.any(|stat| stat.id == rows.statistic_id && stat.is_open());
				if order.status != stage.processing()
					|| order.current_holder.as_deref() != Some(worker_id)
					|| !open
				{
					return Ok(());
				}

				let order = &mut record.order;
				order.status = stage.pool();
				order.current_holder = None;
				order.claimed_at = None;
				order.timeout_at = None;
				order.updated_at = rows.pooled_at;
				record.history.retain(|entry| entry.id != rows.history_id);
				record.statistics.retain(|stat| stat.id != rows.statistic_id);
				Ok(())
			})
			.await;

		if let Err(e) = result {
			tracing::error!(
				order_id = %truncate_id(order_id),
				worker = %worker_id,
				error = %e,
				"Failed to roll back claim, it stays claimed until its deadline"
			);
		}
	}

	/// Frees the worker's slot if it still names `order_id`.
	///
	/// Failures are logged; a slot left behind is reclaimed by the worker's
	/// next claim.
	pub async fn release(&self, worker_id: &str, role: Role, order_id: &str) {
		let names_order = |slot: &ClaimSlot| slot.order_id.as_deref() == Some(order_id);
		if let Err(e) = self.try_release(worker_id, role, names_order).await {
			tracing::warn!(
				order_id = %truncate_id(order_id),
				worker = %worker_id,
				error = %e,
				"Failed to release claim slot"
			);
		}
	}

	async fn release_reservation(&self, worker_id: &str, role: Role, reservation: &str) {
		let reserved = |slot: &ClaimSlot| slot.reservation.as_deref() == Some(reservation);
		if let Err(e) = self.try_release(worker_id, role, reserved).await {
			tracing::warn!(worker = %worker_id, error = %e, "Failed to release claim reservation");
		}
	}

	async fn try_release(
		&self,
		worker_id: &str,
		role: Role,
		matches: impl Fn(&ClaimSlot) -> bool,
	) -> Result<(), WorkflowError> {
		let storage = self.store.storage();
		let claims = StorageKey::Claims.as_str();
		let id = slot_id(worker_id, role);

		for _ in 0..MAX_CONFLICT_RETRIES {
			let Some(current) = storage
				.try_retrieve_stamped::<ClaimSlot>(claims, &id)
				.await
				.map_err(storage_error)?
			else {
				return Ok(());
			};
			if !matches(&current.value) {
				return Ok(());
			}

			let next = ClaimSlot {
				order_id: None,
				reservation: None,
				updated_at: self.store.now(),
				..current.value.clone()
			};
			match storage.swap(claims, &id, Some(&current), &next).await {
				Ok(_) => return Ok(()),
				Err(StorageError::Conflict(_)) => continue,
				Err(e) => return Err(storage_error(e)),
			}
		}
		Err(WorkflowError::StorageUnavailable(format!(
			"claim slot {} is under heavy contention",
			id
		)))
	}

	/// The slot record for a worker and role, if one was ever written.
	pub async fn slot(&self, worker_id: &str, role: Role) -> Result<Option<ClaimSlot>, WorkflowError> {
		self.store
			.storage()
			.try_retrieve_stamped::<ClaimSlot>(StorageKey::Claims.as_str(), &slot_id(worker_id, role))
			.await
			.map(|slot| slot.map(Stamped::into_inner))
			.map_err(storage_error)
	}

	/// Points the worker's slot at `order_id` under a new reservation token
	/// and returns the token.
	async fn reserve_slot(
		&self,
		worker_id: &str,
		role: Role,
		order_id: &str,
	) -> Result<String, WorkflowError> {
		let storage = self.store.storage();
		let claims = StorageKey::Claims.as_str();
		let id = slot_id(worker_id, role);

		for _ in 0..MAX_CONFLICT_RETRIES {
			let current = storage
				.try_retrieve_stamped::<ClaimSlot>(claims, &id)
				.await
				.map_err(storage_error)?;

			let held = current
				.as_ref()
				.and_then(|slot| slot.value.order_id.clone())
				.filter(|held| held != order_id);
			if let Some(held) = held {
				if self.still_holds(worker_id, role, &held).await? {
					return Err(WorkflowError::WorkerBusy {
						worker_id: worker_id.to_string(),
						order_id: held,
					});
				}
				tracing::debug!(
					stale_order = %truncate_id(&held),
					"Taking over claim slot"
				);
			}

			let reservation = uuid::Uuid::new_v4().to_string();
			let next = ClaimSlot {
				worker_id: worker_id.to_string(),
				role,
				order_id: Some(order_id.to_string()),
				reservation: Some(reservation.clone()),
				updated_at: self.store.now(),
			};
			match storage.swap(claims, &id, current.as_ref(), &next).await {
				Ok(_) => return Ok(reservation),
				Err(StorageError::Conflict(_)) => continue,
				Err(e) => return Err(storage_error(e)),
			}
		}
		Err(WorkflowError::StorageUnavailable(format!(
			"claim slot {} is under heavy contention",
			id
		)))
	}

	/// Clears the reservation token if the slot still carries it.
	async fn confirm_slot(
		&self,
		worker_id: &str,
		role: Role,
		reservation: &str,
	) -> Result<Confirmation, WorkflowError> {
		let storage = self.store.storage();
		let claims = StorageKey::Claims.as_str();
		let id = slot_id(worker_id, role);

		for _ in 0..MAX_CONFLICT_RETRIES {
			let Some(current) = storage
				.try_retrieve_stamped::<ClaimSlot>(claims, &id)
				.await
				.map_err(storage_error)?
			else {
				return Ok(Confirmation::Lost(None));
			};
			if current.value.reservation.as_deref() != Some(reservation) {
				return Ok(Confirmation::Lost(current.value.order_id.clone()));
			}

			let next = ClaimSlot {
				reservation: None,
				updated_at: self.store.now(),
				..current.value.clone()
			};
			match storage.swap(claims, &id, Some(&current), &next).await {
				Ok(_) => return Ok(Confirmation::Confirmed),
				Err(StorageError::Conflict(_)) => continue,
				Err(e) => return Err(storage_error(e)),
			}
		}
		Err(WorkflowError::StorageUnavailable(format!(
			"claim slot {} is under heavy contention",
			id
		)))
	}

	/// True if `order_id` is held by the worker in the role's processing status.
	async fn still_holds(
		&self,
		worker_id: &str,
		role: Role,
		order_id: &str,
	) -> Result<bool, WorkflowError> {
		let processing = role.stage().map(|stage| stage.processing());
		match self.store.get(order_id).await {
			Ok(order) => Ok(order.current_holder.as_deref() == Some(worker_id)
				&& Some(order.status) == processing),
			Err(WorkflowError::NotFound(_)) => Ok(false),
			Err(e) => Err(e),
		}
	}

	fn worker_lock(&self, worker_id: &str) -> Arc<Mutex<()>> {
		self.worker_locks
			.entry(worker_id.to_string())
			.or_default()
			.clone()
	}

	/// Drops the worker's lock once no claim is using or waiting on it.
	fn prune_worker_lock(&self, worker_id: &str) {
		self.worker_locks
			.remove_if(worker_id, |_, lock| Arc::strong_count(lock) == 1);
	}
}

fn check_claimable(order: &Order, pool: OrderStatus) -> Result<(), WorkflowError> {
	if order.current_holder.is_some() {
		return Err(WorkflowError::AlreadyClaimed(order.id.clone()));
	}
	if order.status != pool {
		return Err(WorkflowError::NotInPool {
			status: order.status,
		});
	}
	Ok(())
}
