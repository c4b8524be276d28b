//! Claim timeout scheduling.
//!
//! Every claim carries a durable `timeout_at`. The scheduler keeps an
//! in-process timer per claimed order that returns the order to its pool when
//! the deadline passes, and a sweep that rebuilds those timers from the
//! stored deadlines. Timers are an optimisation: a sweep after a restart, or
//! the engine's periodic sweep, finds every overdue claim on its own.
//!
//! A fire re-validates on the current record before writing. If the order
//! has left the claimed status, or was claimed again with a later deadline,
//! the fire does nothing.

use crate::claims::ClaimCoordinator;
use crate::state::transitions::{apply_transition, TransitionInput};
use crate::state::{OrderStore, TransitionTable};
use crate::WorkflowError;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orderflow_config::RetryConfig;
use orderflow_types::{truncate_id, Action, Order, OrderStatus, Stage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::instrument;

/// History note written on system timeouts.
pub const TIMEOUT_NOTE: &str = "Claim time expired; order returned to the pool";

/// Result of a timeout fire that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
	/// The claim was expired and the order is back in its pool.
	TimedOut(Order),
	/// The claim had already been resolved or renewed; nothing was written.
	Stale,
}

/// Counts from one sweep over the claimed orders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
	/// Claimed orders examined.
	pub scanned: usize,
	/// Overdue claims returned to their pool.
	pub fired: usize,
	/// Overdue claims that turned out to be already resolved.
	pub stale: usize,
	/// Overdue claims whose fire failed; they stay claimed.
	pub failed: usize,
	/// Timers armed for claims that had none.
	pub armed: usize,
	pub already_armed: usize,
}

struct ArmedTimer {
	generation: u64,
	deadline: DateTime<Utc>,
	handle: Option<AbortHandle>,
}

/// Arms, disarms and fires claim timeouts.
pub struct TimeoutScheduler {
	store: Arc<OrderStore>,
	claims: Arc<ClaimCoordinator>,
	retry: RetryConfig,
	timers: DashMap<String, ArmedTimer>,
	generation: AtomicU64,
}

impl TimeoutScheduler {
	pub fn new(store: Arc<OrderStore>, claims: Arc<ClaimCoordinator>, retry: RetryConfig) -> Self {
		Self {
			store,
			claims,
			retry,
			timers: DashMap::new(),
			generation: AtomicU64::new(0),
		}
	}

	/// Schedules a fire for `order_id` at `deadline`, replacing any timer
	/// already armed for the order.
	///
	/// When the timer fires the claim is expired only if the order is still
	/// in `expected`.
	pub fn arm(self: &Arc<Self>, order_id: &str, expected: OrderStatus, deadline: DateTime<Utc>) {
		let generation = self.generation.fetch_add(1, Ordering::Relaxed);
		let replaced = self.timers.insert(
			order_id.to_string(),
			ArmedTimer {
				generation,
				deadline,
				handle: None,
			},
		);
		if let Some(handle) = replaced.and_then(|timer| timer.handle) {
			handle.abort();
		}

		let scheduler = Arc::clone(self);
		let id = order_id.to_string();
		let task = tokio::spawn(async move {
			loop {
				let remaining = deadline - scheduler.store.now();
				if remaining <= chrono::Duration::zero() {
					break;
				}
				tokio::time::sleep(remaining.to_std().unwrap_or(Duration::ZERO)).await;
			}
			// Only the current generation may fire; a disarm or re-arm in the
			// meantime has removed or replaced the entry.
			if scheduler
				.timers
				.remove_if(&id, |_, timer| timer.generation == generation)
				.is_some()
			{
				let result = scheduler.fire(&id, expected).await;
				scheduler.log_fire(&id, expected, result);
			}
		});

		if let Some(mut timer) = self.timers.get_mut(order_id) {
			if timer.generation == generation {
				timer.handle = Some(task.abort_handle());
			}
		}
		tracing::debug!(
			order_id = %truncate_id(order_id),
			status = %expected,
			deadline = %deadline,
			"Timeout armed"
		);
	}

	/// Cancels the pending timer for `order_id`. Does nothing if none is armed.
	pub fn disarm(&self, order_id: &str) {
		if let Some((_, timer)) = self.timers.remove(order_id) {
			if let Some(handle) = timer.handle {
				handle.abort();
			}
			tracing::debug!(order_id = %truncate_id(order_id), "Timeout disarmed");
		}
	}

	/// Cancels the timer for `order_id` only if it was armed for `deadline`.
	pub fn disarm_at(&self, order_id: &str, deadline: DateTime<Utc>) {
		if let Some((_, timer)) = self
			.timers
			.remove_if(order_id, |_, timer| timer.deadline == deadline)
		{
			if let Some(handle) = timer.handle {
				handle.abort();
			}
			tracing::debug!(order_id = %truncate_id(order_id), "Timeout disarmed");
		}
	}

	pub fn is_armed(&self, order_id: &str) -> bool {
		self.timers.contains_key(order_id)
	}

	pub fn armed_count(&self) -> usize {
		self.timers.len()
	}

	/// Deadline of the armed timer for `order_id`.
	pub fn deadline(&self, order_id: &str) -> Option<DateTime<Utc>> {
		self.timers.get(order_id).map(|timer| timer.deadline)
	}

	/// Expires the claim on `order_id` if it is still in `expected` and due.
	///
	/// Storage failures are retried with exponential backoff. When retries
	/// run out the error is returned and the order stays claimed.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id), status = %expected))]
	pub async fn fire(
		&self,
		order_id: &str,
		expected: OrderStatus,
	) -> Result<FireOutcome, WorkflowError> {
		backoff::future::retry_notify(
			self.backoff(),
			move || async move {
				match self.fire_once(order_id, expected).await {
					Ok(outcome) => Ok(outcome),
					Err(e @ WorkflowError::StorageUnavailable(_)) => Err(backoff::Error::transient(e)),
					Err(e) => Err(backoff::Error::permanent(e)),
				}
			},
			|e: WorkflowError, wait: Duration| {
				tracing::warn!(error = %e, retry_in = ?wait, "Timeout fire failed, retrying");
			},
		)
		.await
	}

	/// A single fire attempt without retries.
	async fn fire_once(
		&self,
		order_id: &str,
		expected: OrderStatus,
	) -> Result<FireOutcome, WorkflowError> {
		match self.try_fire(order_id, expected).await {
			Err(WorkflowError::NotFound(_)) => Ok(FireOutcome::Stale),
			result => result,
		}
	}

	async fn try_fire(
		&self,
		order_id: &str,
		expected: OrderStatus,
	) -> Result<FireOutcome, WorkflowError> {
		let (record, holder) = self
			.store
			.update(order_id, |record| {
				let now = self.store.now();
				let order = &record.order;
				let due = order.timeout_at.is_some_and(|deadline| deadline <= now);
				if order.status != expected || order.current_holder.is_none() || !due {
					return Ok(None);
				}
				let Some(next) = TransitionTable::next_state(expected, Action::Timeout) else {
					return Ok(None);
				};

				let holder = order.current_holder.clone();
				apply_transition(
					record,
					next,
					TransitionInput {
						action: Action::Timeout,
						actor_id: None,
						notes: Some(TIMEOUT_NOTE.to_string()),
						tracking_number: None,
						now,
					},
				);
				Ok(holder)
			})
			.await?;

		let Some(holder) = holder else {
			return Ok(FireOutcome::Stale);
		};
		if let Some(stage) = expected.stage() {
			self.claims.release(&holder, stage.role(), order_id).await;
		}
		Ok(FireOutcome::TimedOut(record.order))
	}

	fn log_fire(
		&self,
		order_id: &str,
		expected: OrderStatus,
		result: Result<FireOutcome, WorkflowError>,
	) -> FireResult {
		match result {
			Ok(FireOutcome::TimedOut(order)) => {
				tracing::info!(
					order_id = %truncate_id(order_id),
					order_number = %order.order_number,
					from = %expected,
					to = %order.status,
					previous_holder = ?order.previous_holder,
					"Claim timed out"
				);
				FireResult::Fired
			},
			Ok(FireOutcome::Stale) => {
				tracing::debug!(
					order_id = %truncate_id(order_id),
					expected = %expected,
					"Timeout fire skipped, claim already resolved"
				);
				FireResult::Stale
			},
			Err(e) => {
				tracing::error!(
					order_id = %truncate_id(order_id),
					error = %e,
					"Timeout fire failed, order stays claimed"
				);
				FireResult::Failed
			},
		}
	}

	/// Fires every overdue claim and arms a timer for every claim without one.
	///
	/// Overdue claims get a single attempt each; a claim whose fire fails
	/// stays overdue and is picked up again by the next sweep.
	pub async fn sweep(self: &Arc<Self>) -> Result<SweepReport, WorkflowError> {
		let processing: Vec<OrderStatus> = Stage::all().map(|stage| stage.processing()).collect();
		let claimed = self.store.list_by_status(&processing).await?;
		let now = self.store.now();

		let mut report = SweepReport {
			scanned: claimed.len(),
			..SweepReport::default()
		};
		for order in claimed {
			let Some(deadline) = order.timeout_at else {
				continue;
			};
			if deadline <= now {
				self.disarm(&order.id);
				let result = self.fire_once(&order.id, order.status).await;
				match self.log_fire(&order.id, order.status, result) {
					FireResult::Fired => report.fired += 1,
					FireResult::Stale => report.stale += 1,
					FireResult::Failed => report.failed += 1,
				}
			} else if self.deadline(&order.id) == Some(deadline) {
				report.already_armed += 1;
			} else {
				self.arm(&order.id, order.status, deadline);
				report.armed += 1;
			}
		}
		Ok(report)
	}

	/// Rebuilds timers from stored deadlines after a restart.
	#[instrument(skip_all)]
	pub async fn restore_all(self: &Arc<Self>) -> Result<SweepReport, WorkflowError> {
		let report = self.sweep().await?;
		tracing::info!(
			scanned = report.scanned,
			fired = report.fired,
			armed = report.armed,
			failed = report.failed,
			"Restored claim timeouts"
		);
		Ok(report)
	}

	/// Aborts every armed timer.
	pub fn shutdown(&self) {
		let count = self.timers.len();
		self.timers.retain(|_, timer| {
			if let Some(handle) = timer.handle.take() {
				handle.abort();
			}
			false
		});
		tracing::debug!(count, "Timeout timers stopped");
	}

	fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(self.retry.initial_interval_ms))
			.with_max_interval(Duration::from_secs(self.retry.max_interval_seconds))
			.with_max_elapsed_time(Some(Duration::from_secs(self.retry.max_elapsed_seconds)))
			.build()
	}
}

enum FireResult {
	Fired,
	Stale,
	Failed,
}
