//! Workflow orchestrator.
//!
//! The single entry point through which callers act on orders. Each action
//! is authorized against the actor's roles, checked against the transition
//! table and applied to the order record in one atomic write together with
//! its history row. Claims are delegated to the [`ClaimCoordinator`], and
//! claim timers are armed and disarmed on the [`TimeoutScheduler`] once the
//! write has committed.

use crate::claims::ClaimCoordinator;
use crate::scheduler::{TimeoutScheduler, TIMEOUT_NOTE};
use crate::state::transitions::{apply_transition, history_entry, TransitionInput};
use crate::state::{OrderStore, TransitionTable};
use crate::WorkflowError;
use orderflow_types::{
	truncate_id, Action, Actor, NewOrder, Order, OrderHistoryEntry, OrderRecord, OrderStatus, Role,
	RoleSet, WorkStatistic,
};
use std::sync::Arc;
use tracing::instrument;

/// Optional data supplied with an action.
#[derive(Debug, Clone, Default)]
pub struct ActionPayload {
	/// Free text stored on the history row.
	pub notes: Option<String>,
	/// Shipment tracking number, accepted on the printer's final `complete`.
	pub tracking_number: Option<String>,
}

impl ActionPayload {
	pub fn with_notes(notes: impl Into<String>) -> Self {
		Self {
			notes: Some(notes.into()),
			..Self::default()
		}
	}
}

/// Performs workflow actions on orders.
pub struct WorkflowOrchestrator {
	store: Arc<OrderStore>,
	claims: Arc<ClaimCoordinator>,
	scheduler: Arc<TimeoutScheduler>,
	order_number_prefix: String,
}

impl WorkflowOrchestrator {
	pub fn new(
		store: Arc<OrderStore>,
		claims: Arc<ClaimCoordinator>,
		scheduler: Arc<TimeoutScheduler>,
		order_number_prefix: impl Into<String>,
	) -> Self {
		Self {
			store,
			claims,
			scheduler,
			order_number_prefix: order_number_prefix.into(),
		}
	}

	/// Creates an order in `created` with a fresh order number.
	#[instrument(skip_all, fields(actor = ?actor.id()))]
	pub async fn create_order(&self, actor: &Actor, new: NewOrder) -> Result<Order, WorkflowError> {
		let Actor::User { id: actor_id, roles } = actor else {
			return Err(WorkflowError::Forbidden(
				"orders are created by office staff".into(),
			));
		};
		if !TransitionTable::is_permitted(Action::Create, OrderStatus::Created, roles) {
			return Err(WorkflowError::Forbidden(format!(
				"user {} may not create orders",
				actor_id
			)));
		}
		if new.client_name.trim().is_empty() {
			return Err(WorkflowError::Validation("client_name must not be empty".into()));
		}
		if new.product_type.trim().is_empty() {
			return Err(WorkflowError::Validation("product_type must not be empty".into()));
		}

		let order_number = self
			.store
			.next_order_number(&self.order_number_prefix)
			.await?;
		let now = self.store.now();
		let id = uuid::Uuid::new_v4().to_string();
		let order = Order {
			id: id.clone(),
			order_number,
			status: OrderStatus::Created,
			product_type: new.product_type.trim().to_string(),
			client_name: Some(new.client_name.trim().to_string()),
			client_email: new.client_email,
			client_phone: new.client_phone,
			client_notes: new.client_notes,
			created_by: actor_id.clone(),
			current_holder: None,
			previous_holder: None,
			claimed_at: None,
			timeout_at: None,
			tracking_number: None,
			created_at: now,
			updated_at: now,
		};
		let record = OrderRecord {
			history: vec![history_entry(
				&id,
				OrderStatus::Created,
				OrderStatus::Created,
				Action::Create,
				Some(actor_id.as_str()),
				Some("Order created".into()),
				now,
			)],
			statistics: Vec::new(),
			order,
		};
		self.store.insert(&record).await?;

		tracing::info!(
			order_id = %truncate_id(&id),
			order_number = %record.order.order_number,
			"Order created"
		);
		Ok(record.order)
	}

	/// Performs `action` on `order_id` as `actor` and returns the updated order.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id), action = %action))]
	pub async fn perform(
		&self,
		order_id: &str,
		action: Action,
		actor: &Actor,
		payload: ActionPayload,
	) -> Result<Order, WorkflowError> {
		if action == Action::Claim {
			return self.claim_order(order_id, actor, payload).await;
		}

		let notes = match (actor, payload.notes) {
			(Actor::System, None) if action == Action::Timeout => Some(TIMEOUT_NOTE.to_string()),
			(_, notes) => notes,
		};
		let (record, (from, holder)) = self
			.store
			.update(order_id, |record| {
				let from = record.order.status;
				let next = plan(&record.order, action, actor)?;
				let holder = record.order.current_holder.clone();
				apply_transition(
					record,
					next,
					TransitionInput {
						action,
						actor_id: actor.id(),
						notes: notes.clone(),
						tracking_number: payload.tracking_number.clone(),
						now: self.store.now(),
					},
				);
				Ok((from, holder))
			})
			.await?;

		if let Some(holder) = holder {
			if !record.order.status.is_processing() {
				self.scheduler.disarm(order_id);
				if let Some(stage) = from.stage() {
					self.claims.release(&holder, stage.role(), order_id).await;
				}
			}
		}

		tracing::info!(
			order_number = %record.order.order_number,
			from = %from,
			to = %record.order.status,
			actor = ?actor.id(),
			"Order transitioned"
		);
		Ok(record.order)
	}

	async fn claim_order(
		&self,
		order_id: &str,
		actor: &Actor,
		payload: ActionPayload,
	) -> Result<Order, WorkflowError> {
		let order = self.store.get(order_id).await?;
		authorize(&order, Action::Claim, actor)?;
		let (worker_id, roles) = match actor {
			Actor::User { id, roles } => (id, roles),
			Actor::System => {
				return Err(WorkflowError::Forbidden("the system actor cannot claim orders".into()))
			},
		};
		let role = claim_role(&order, roles).ok_or_else(|| {
			WorkflowError::Forbidden(format!("user {} holds no production role", worker_id))
		})?;

		let order = self
			.claims
			.try_claim(order_id, worker_id, role, payload.notes)
			.await?;
		self.arm_claim_timeout(&order).await;
		Ok(order)
	}

	/// Arms the timer for a fresh claim, then drops it again if the claim
	/// was resolved before the timer existed for the resolution to disarm.
	async fn arm_claim_timeout(&self, order: &Order) {
		let Some(deadline) = order.timeout_at else {
			return;
		};
		self.scheduler.arm(&order.id, order.status, deadline);

		match self.store.get(&order.id).await {
			Ok(current) if current.timeout_at == Some(deadline) => {},
			Ok(_) | Err(WorkflowError::NotFound(_)) => {
				self.scheduler.disarm_at(&order.id, deadline);
			},
			Err(e) => {
				tracing::debug!(error = %e, "Could not recheck claim after arming its timeout");
			},
		}
	}

	pub async fn submit(
		&self,
		order_id: &str,
		actor: &Actor,
		payload: ActionPayload,
	) -> Result<Order, WorkflowError> {
		self.perform(order_id, Action::Submit, actor, payload).await
	}

	pub async fn claim(
		&self,
		order_id: &str,
		actor: &Actor,
		payload: ActionPayload,
	) -> Result<Order, WorkflowError> {
		self.perform(order_id, Action::Claim, actor, payload).await
	}

	pub async fn complete(
		&self,
		order_id: &str,
		actor: &Actor,
		payload: ActionPayload,
	) -> Result<Order, WorkflowError> {
		self.perform(order_id, Action::Complete, actor, payload).await
	}

	pub async fn reject(
		&self,
		order_id: &str,
		actor: &Actor,
		payload: ActionPayload,
	) -> Result<Order, WorkflowError> {
		self.perform(order_id, Action::Reject, actor, payload).await
	}

	pub async fn approve(
		&self,
		order_id: &str,
		actor: &Actor,
		payload: ActionPayload,
	) -> Result<Order, WorkflowError> {
		self.perform(order_id, Action::Approve, actor, payload).await
	}

	pub async fn cancel(
		&self,
		order_id: &str,
		actor: &Actor,
		payload: ActionPayload,
	) -> Result<Order, WorkflowError> {
		self.perform(order_id, Action::Cancel, actor, payload).await
	}

	/// Expires the claim on `order_id` right away, regardless of its deadline.
	pub async fn timeout(&self, order_id: &str) -> Result<Order, WorkflowError> {
		self.perform(order_id, Action::Timeout, &Actor::System, ActionPayload::default())
			.await
	}

	pub async fn get(&self, order_id: &str) -> Result<Order, WorkflowError> {
		self.store.get(order_id).await
	}

	/// The order with client details hidden from roles that may not see them.
	pub async fn get_redacted(&self, order_id: &str, roles: &RoleSet) -> Result<Order, WorkflowError> {
		self.store
			.get(order_id)
			.await
			.map(|order| order.redacted_for(roles))
	}

	pub async fn history(&self, order_id: &str) -> Result<Vec<OrderHistoryEntry>, WorkflowError> {
		self.store.history(order_id).await
	}

	pub async fn statistics(&self, order_id: &str) -> Result<Vec<WorkStatistic>, WorkflowError> {
		self.store.statistics(order_id).await
	}

	/// Orders waiting in `status`, oldest first.
	pub async fn pool(&self, status: OrderStatus) -> Result<Vec<Order>, WorkflowError> {
		self.store.list_by_status(&[status]).await
	}

	/// Orders in any of `statuses`, oldest first.
	pub async fn pools(&self, statuses: &[OrderStatus]) -> Result<Vec<Order>, WorkflowError> {
		self.store.list_by_status(statuses).await
	}

	/// Orders awaiting quality control in any stage, oldest first.
	pub async fn qc_queue(&self) -> Result<Vec<Order>, WorkflowError> {
		let reviews: Vec<OrderStatus> = OrderStatus::all().filter(|s| s.is_qc_review()).collect();
		self.store.list_by_status(&reviews).await
	}
}

/// Checks that `actor` may attempt `action` on `order` at all.
fn authorize(order: &Order, action: Action, actor: &Actor) -> Result<(), WorkflowError> {
	match actor {
		Actor::System if action == Action::Timeout => Ok(()),
		Actor::System => Err(WorkflowError::Forbidden(format!(
			"the system actor may not perform '{}'",
			action
		))),
		Actor::User { id, .. } if action == Action::Timeout => Err(WorkflowError::Forbidden(
			format!("user {} may not perform '{}'; timeouts are applied by the system", id, action),
		)),
		Actor::User { id, roles } => {
			if TransitionTable::is_permitted(action, order.status, roles) {
				Ok(())
			} else {
				Err(WorkflowError::Forbidden(format!(
					"user {} may not perform '{}' on an order in '{}'",
					id, action, order.status
				)))
			}
		},
	}
}

/// Validates a non-claim action against the current order and returns the
/// status it leads to.
fn plan(order: &Order, action: Action, actor: &Actor) -> Result<OrderStatus, WorkflowError> {
	if action == Action::Create {
		return Err(WorkflowError::InvalidTransition {
			status: order.status,
			action,
		});
	}
	authorize(order, action, actor)?;

	if let Actor::User { id, roles } = actor {
		let holder_scoped = matches!(action, Action::Complete | Action::Reject);
		if holder_scoped && order.status.is_processing() {
			if order.current_holder.as_deref() != Some(id.as_str()) {
				return Err(WorkflowError::Forbidden(format!(
					"order is held by {}",
					order.current_holder.as_deref().unwrap_or("nobody")
				)));
			}
		} else if action == Action::Complete && order.status.is_rework() {
			let stage_role = order.status.stage().map(|stage| stage.role());
			if !stage_role.is_some_and(|role| roles.contains(role)) {
				return Err(WorkflowError::Forbidden(format!(
					"rework in '{}' is completed by the stage's workers",
					order.status
				)));
			}
		}
	}

	TransitionTable::next_state(order.status, action).ok_or(WorkflowError::InvalidTransition {
		status: order.status,
		action,
	})
}

/// The role an actor claims `order` in: the role of the order's stage if the
/// actor holds it, otherwise any production role the actor holds.
fn claim_role(order: &Order, roles: &RoleSet) -> Option<Role> {
	order
		.status
		.stage()
		.map(|stage| stage.role())
		.filter(|role| roles.contains(*role))
		.or_else(|| roles.iter().find(|role| role.stage().is_some()))
}
