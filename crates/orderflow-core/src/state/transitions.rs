//! Order state machine.
//!
//! The legal status changes form a fixed table keyed by (status, action).
//! Every production stage has the same shape:
//!
//! ```text
//! pool --claim--> processing --complete--> qc review --approve--> next pool
//!                  |  ^                        |
//!       reject,    |  |                      reject
//!       timeout    v  |                        v
//!                 pool  <------timeout------ rework --complete--> qc review
//! ```
//!
//! The printer stage has no review: completing it finishes the order.
//! `cancel` is accepted from every non-terminal status and is handled outside
//! the table. Which roles may attempt an action is a separate check layered
//! on top; both must pass.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use orderflow_types::{
	Action, ClaimOutcome, OrderHistoryEntry, OrderRecord, OrderStatus, Role, RoleSet, Stage,
};
use std::collections::HashMap;

/// Static transition table, built once from the stage definitions.
static TRANSITIONS: Lazy<HashMap<(OrderStatus, Action), OrderStatus>> = Lazy::new(|| {
	let mut m = HashMap::new();
	m.insert(
		(OrderStatus::Created, Action::Submit),
		Stage::Editor.pool(),
	);

	for stage in Stage::all() {
		let pool = stage.pool();
		let processing = stage.processing();

		m.insert((pool, Action::Claim), processing);
		m.insert((processing, Action::Reject), pool);
		m.insert((processing, Action::Timeout), pool);

		match (stage.qc_review(), stage.rework()) {
			(Some(review), Some(rework)) => {
				m.insert((processing, Action::Complete), review);
				m.insert((review, Action::Reject), rework);
				m.insert((rework, Action::Complete), review);
				m.insert((rework, Action::Timeout), pool);
				if let Some(next) = stage.next() {
					m.insert((review, Action::Approve), next.pool());
				}
			},
			_ => {
				m.insert((processing, Action::Complete), OrderStatus::Completed);
			},
		}
	}
	m
});

const OFFICE_ROLES: [Role; 2] = [Role::Administrator, Role::OfficeEmployee];
const PRODUCTION_ROLES: [Role; 4] = [
	Role::Editor,
	Role::Illustrator,
	Role::GraphicDesigner,
	Role::Printer,
];
const REVIEW_ROLES: [Role; 2] = [Role::QualityControl, Role::Administrator];
const ADMIN_ROLES: [Role; 1] = [Role::Administrator];

/// Pure lookups over the transition table and the role allow-lists.
pub struct TransitionTable;

impl TransitionTable {
	/// Returns the status reached by performing `action` in `status`, or
	/// `None` when the pair is not a legal transition.
	pub fn next_state(status: OrderStatus, action: Action) -> Option<OrderStatus> {
		if action == Action::Cancel {
			return (!status.is_terminal()).then_some(OrderStatus::Cancelled);
		}
		TRANSITIONS.get(&(status, action)).copied()
	}

	/// Roles allowed to attempt `action` on an order in `status`.
	///
	/// `reject` in a QC review status is the reviewer's decision; everywhere
	/// else it is the worker handing the order back. `timeout` has no user
	/// roles at all.
	pub fn allowed_roles(action: Action, status: OrderStatus) -> &'static [Role] {
		match action {
			Action::Create | Action::Submit => &OFFICE_ROLES,
			Action::Reject if status.is_qc_review() => &REVIEW_ROLES,
			Action::Claim | Action::Complete | Action::Reject => &PRODUCTION_ROLES,
			Action::Approve => &REVIEW_ROLES,
			Action::Cancel => &ADMIN_ROLES,
			Action::Timeout => &[],
		}
	}

	/// True when `roles` shares at least one role with the allow-list.
	pub fn is_permitted(action: Action, status: OrderStatus, roles: &RoleSet) -> bool {
		roles.intersects(Self::allowed_roles(action, status))
	}
}

/// What is recorded alongside a status change.
pub(crate) struct TransitionInput<'a> {
	pub action: Action,
	pub actor_id: Option<&'a str>,
	pub notes: Option<String>,
	pub tracking_number: Option<String>,
	pub now: DateTime<Utc>,
}

/// Moves `record` to `next`, releasing any active claim and appending the
/// matching history row.
///
/// Callers have already checked that `next` is what the table allows.
pub(crate) fn apply_transition(
	record: &mut OrderRecord,
	next: OrderStatus,
	input: TransitionInput<'_>,
) {
	let from = record.order.status;

	if record.order.current_holder.is_some() && !next.is_processing() {
		let outcome = match input.action {
			Action::Reject => ClaimOutcome::Rejected,
			Action::Timeout => ClaimOutcome::TimedOut,
			Action::Cancel => ClaimOutcome::Cancelled,
			_ => ClaimOutcome::Completed,
		};
		if let Some(stat) = record.open_statistic_mut() {
			stat.close(outcome, input.now);
		}
		record.order.release_claim();
	}

	if input.action == Action::Complete && from == OrderStatus::PrinterProcessing {
		if let Some(tracking_number) = input.tracking_number {
			record.order.tracking_number = Some(tracking_number);
		}
	}

	record.order.status = next;
	record.order.updated_at = input.now;
	record.history.push(history_entry(
		&record.order.id,
		from,
		next,
		input.action,
		input.actor_id,
		input.notes,
		input.now,
	));
}

pub(crate) fn history_entry(
	order_id: &str,
	from_status: OrderStatus,
	to_status: OrderStatus,
	action: Action,
	actor_id: Option<&str>,
	notes: Option<String>,
	created_at: DateTime<Utc>,
) -> OrderHistoryEntry {
	OrderHistoryEntry {
		id: uuid::Uuid::new_v4().to_string(),
		order_id: order_id.to_string(),
		from_status,
		to_status,
		action,
		actor_id: actor_id.map(str::to_string),
		notes,
		created_at,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use orderflow_types::{Order, WorkStatistic};
	use orderflow_types::OrderStatus::*;

	/// The complete table, written out by hand.
	fn expected() -> Vec<(OrderStatus, Action, OrderStatus)> {
		vec![
			(Created, Action::Submit, EditorPool),
			(EditorPool, Action::Claim, EditorProcessing),
			(EditorProcessing, Action::Complete, QcEditorReview),
			(EditorProcessing, Action::Reject, EditorPool),
			(EditorProcessing, Action::Timeout, EditorPool),
			(QcEditorReview, Action::Approve, IllustratorPool),
			(QcEditorReview, Action::Reject, EditorRework),
			(EditorRework, Action::Complete, QcEditorReview),
			(EditorRework, Action::Timeout, EditorPool),
			(IllustratorPool, Action::Claim, IllustratorProcessing),
			(IllustratorProcessing, Action::Complete, QcIllustratorReview),
			(IllustratorProcessing, Action::Reject, IllustratorPool),
			(IllustratorProcessing, Action::Timeout, IllustratorPool),
			(QcIllustratorReview, Action::Approve, DesignerPool),
			(QcIllustratorReview, Action::Reject, IllustratorRework),
			(IllustratorRework, Action::Complete, QcIllustratorReview),
			(IllustratorRework, Action::Timeout, IllustratorPool),
			(DesignerPool, Action::Claim, DesignerProcessing),
			(DesignerProcessing, Action::Complete, QcDesignerReview),
			(DesignerProcessing, Action::Reject, DesignerPool),
			(DesignerProcessing, Action::Timeout, DesignerPool),
			(QcDesignerReview, Action::Approve, PrinterPool),
			(QcDesignerReview, Action::Reject, DesignerRework),
			(DesignerRework, Action::Complete, QcDesignerReview),
			(DesignerRework, Action::Timeout, DesignerPool),
			(PrinterPool, Action::Claim, PrinterProcessing),
			(PrinterProcessing, Action::Complete, Completed),
			(PrinterProcessing, Action::Reject, PrinterPool),
			(PrinterProcessing, Action::Timeout, PrinterPool),
		]
	}

	#[test]
	fn test_table_is_exhaustive_and_exact() {
		let expected = expected();
		for status in OrderStatus::all() {
			for action in Action::all().filter(|a| *a != Action::Cancel) {
				let want = expected
					.iter()
					.find(|(s, a, _)| *s == status && *a == action)
					.map(|(_, _, next)| *next);
				assert_eq!(
					TransitionTable::next_state(status, action),
					want,
					"{} + {}",
					status,
					action
				);
			}
		}
	}

	#[test]
	fn test_cancel_from_every_non_terminal_status() {
		let mut accepted = 0;
		for status in OrderStatus::all() {
			let next = TransitionTable::next_state(status, Action::Cancel);
			if status.is_terminal() {
				assert_eq!(next, None);
			} else {
				assert_eq!(next, Some(Cancelled));
				accepted += 1;
			}
		}
		assert_eq!(accepted, 16);
	}

	#[test]
	fn test_terminal_statuses_have_no_exits() {
		for action in Action::all() {
			assert_eq!(TransitionTable::next_state(Completed, action), None);
			assert_eq!(TransitionTable::next_state(Cancelled, action), None);
		}
	}

	#[test]
	fn test_role_allow_lists() {
		let office = RoleSet::new([Role::OfficeEmployee]);
		let editor = RoleSet::new([Role::Editor]);
		let qc = RoleSet::new([Role::QualityControl]);
		let admin = RoleSet::new([Role::Administrator]);

		assert!(TransitionTable::is_permitted(Action::Submit, Created, &office));
		assert!(TransitionTable::is_permitted(Action::Submit, Created, &admin));
		assert!(!TransitionTable::is_permitted(Action::Submit, Created, &editor));

		assert!(TransitionTable::is_permitted(Action::Claim, EditorPool, &editor));
		assert!(!TransitionTable::is_permitted(Action::Claim, EditorPool, &admin));

		assert!(TransitionTable::is_permitted(Action::Approve, QcEditorReview, &qc));
		assert!(!TransitionTable::is_permitted(Action::Approve, QcEditorReview, &editor));

		assert!(TransitionTable::is_permitted(Action::Reject, EditorProcessing, &editor));
		assert!(!TransitionTable::is_permitted(Action::Reject, EditorProcessing, &qc));
		assert!(TransitionTable::is_permitted(Action::Reject, QcEditorReview, &qc));
		assert!(!TransitionTable::is_permitted(Action::Reject, QcEditorReview, &editor));

		assert!(TransitionTable::is_permitted(Action::Cancel, EditorPool, &admin));
		assert!(!TransitionTable::is_permitted(Action::Cancel, EditorPool, &office));

		for status in OrderStatus::all() {
			assert!(TransitionTable::allowed_roles(Action::Timeout, status).is_empty());
		}
	}

	fn claimed_record() -> OrderRecord {
		let now = Utc::now();
		OrderRecord {
			order: Order {
				id: "order-1".into(),
				order_number: "ZL-2026-0001".into(),
				status: PrinterProcessing,
				product_type: "book".into(),
				client_name: Some("Jane".into()),
				client_email: None,
				client_phone: None,
				client_notes: None,
				created_by: "office-1".into(),
				current_holder: Some("printer-1".into()),
				previous_holder: None,
				claimed_at: Some(now),
				timeout_at: Some(now + chrono::Duration::hours(2)),
				tracking_number: None,
				created_at: now,
				updated_at: now,
			},
			history: Vec::new(),
			statistics: vec![WorkStatistic {
				id: "stat-1".into(),
				worker_id: "printer-1".into(),
				order_id: "order-1".into(),
				role: Role::Printer,
				stage: Stage::Printer,
				claimed_at: now,
				completed_at: None,
				duration_seconds: None,
				was_rejected: false,
				outcome: None,
			}],
		}
	}

	#[test]
	fn test_apply_completion_sets_tracking_and_releases_claim() {
		let mut record = claimed_record();
		let now = Utc::now();
		apply_transition(
			&mut record,
			Completed,
			TransitionInput {
				action: Action::Complete,
				actor_id: Some("printer-1"),
				notes: Some("shipped".into()),
				tracking_number: Some("TRK-1".into()),
				now,
			},
		);

		let order = &record.order;
		assert_eq!(order.status, Completed);
		assert_eq!(order.tracking_number.as_deref(), Some("TRK-1"));
		assert_eq!(order.current_holder, None);
		assert_eq!(order.previous_holder.as_deref(), Some("printer-1"));
		assert_eq!(order.claimed_at, None);
		assert_eq!(order.timeout_at, None);

		assert_eq!(record.history.len(), 1);
		let entry = &record.history[0];
		assert_eq!((entry.from_status, entry.to_status), (PrinterProcessing, Completed));
		assert_eq!(entry.actor_id.as_deref(), Some("printer-1"));

		assert_eq!(
			record.statistics[0].outcome,
			Some(ClaimOutcome::Completed)
		);
	}

	#[test]
	fn test_apply_timeout_records_system_actor() {
		let mut record = claimed_record();
		apply_transition(
			&mut record,
			PrinterPool,
			TransitionInput {
				action: Action::Timeout,
				actor_id: None,
				notes: None,
				tracking_number: Some("ignored".into()),
				now: Utc::now(),
			},
		);

		assert_eq!(record.order.tracking_number, None);
		assert_eq!(record.history[0].actor_id, None);
		assert_eq!(record.history[0].action, Action::Timeout);
		assert_eq!(record.statistics[0].outcome, Some(ClaimOutcome::TimedOut));
		assert!(!record.statistics[0].was_rejected);
	}
}
