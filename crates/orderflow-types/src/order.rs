//! Order types for the workflow system.
//!
//! This module defines the order itself, the status it moves through, the
//! append-only history written with every transition, and the per-claim work
//! statistics. An order is persisted together with its history and statistics
//! as a single [`OrderRecord`] so that a status change and its audit row are
//! always written in the same storage operation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Action, Role, RoleSet, Stage};

/// Status of an order in the production workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
	/// Created by the office, not yet submitted into the workflow.
	Created,
	EditorPool,
	EditorProcessing,
	QcEditorReview,
	EditorRework,
	IllustratorPool,
	IllustratorProcessing,
	QcIllustratorReview,
	IllustratorRework,
	DesignerPool,
	DesignerProcessing,
	QcDesignerReview,
	DesignerRework,
	PrinterPool,
	PrinterProcessing,
	/// Printed and shipped. Terminal.
	Completed,
	/// Cancelled by an administrator. Terminal.
	Cancelled,
}

impl OrderStatus {
	/// Returns every status.
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Created,
			Self::EditorPool,
			Self::EditorProcessing,
			Self::QcEditorReview,
			Self::EditorRework,
			Self::IllustratorPool,
			Self::IllustratorProcessing,
			Self::QcIllustratorReview,
			Self::IllustratorRework,
			Self::DesignerPool,
			Self::DesignerProcessing,
			Self::QcDesignerReview,
			Self::DesignerRework,
			Self::PrinterPool,
			Self::PrinterProcessing,
			Self::Completed,
			Self::Cancelled,
		]
		.into_iter()
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			OrderStatus::Created => "created",
			OrderStatus::EditorPool => "editor_pool",
			OrderStatus::EditorProcessing => "editor_processing",
			OrderStatus::QcEditorReview => "qc_editor_review",
			OrderStatus::EditorRework => "editor_rework",
			OrderStatus::IllustratorPool => "illustrator_pool",
			OrderStatus::IllustratorProcessing => "illustrator_processing",
			OrderStatus::QcIllustratorReview => "qc_illustrator_review",
			OrderStatus::IllustratorRework => "illustrator_rework",
			OrderStatus::DesignerPool => "designer_pool",
			OrderStatus::DesignerProcessing => "designer_processing",
			OrderStatus::QcDesignerReview => "qc_designer_review",
			OrderStatus::DesignerRework => "designer_rework",
			OrderStatus::PrinterPool => "printer_pool",
			OrderStatus::PrinterProcessing => "printer_processing",
			OrderStatus::Completed => "completed",
			OrderStatus::Cancelled => "cancelled",
		}
	}

	/// The production stage this status belongs to, if any.
	pub fn stage(&self) -> Option<Stage> {
		match self {
			OrderStatus::EditorPool
			| OrderStatus::EditorProcessing
			| OrderStatus::QcEditorReview
			| OrderStatus::EditorRework => Some(Stage::Editor),
			OrderStatus::IllustratorPool
			| OrderStatus::IllustratorProcessing
			| OrderStatus::QcIllustratorReview
			| OrderStatus::IllustratorRework => Some(Stage::Illustrator),
			OrderStatus::DesignerPool
			| OrderStatus::DesignerProcessing
			| OrderStatus::QcDesignerReview
			| OrderStatus::DesignerRework => Some(Stage::Designer),
			OrderStatus::PrinterPool | OrderStatus::PrinterProcessing => Some(Stage::Printer),
			OrderStatus::Created | OrderStatus::Completed | OrderStatus::Cancelled => None,
		}
	}

	pub fn is_pool(&self) -> bool {
		self.stage().is_some_and(|stage| stage.pool() == *self)
	}

	/// Claimed by a worker. The only statuses with a holder.
	pub fn is_processing(&self) -> bool {
		self.stage().is_some_and(|stage| stage.processing() == *self)
	}

	pub fn is_qc_review(&self) -> bool {
		self.stage().and_then(|stage| stage.qc_review()) == Some(*self)
	}

	pub fn is_rework(&self) -> bool {
		self.stage().and_then(|stage| stage.rework()) == Some(*self)
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OrderStatus {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		OrderStatus::all()
			.find(|status| status.as_str() == s)
			.ok_or_else(|| format!("unknown order status '{}'", s))
	}
}

/// A production order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
	/// Unique identifier for this order.
	pub id: String,
	/// Human readable number, e.g. `ZL-2026-0042`.
	pub order_number: String,
	pub status: OrderStatus,
	pub product_type: String,
	pub client_name: Option<String>,
	pub client_email: Option<String>,
	pub client_phone: Option<String>,
	pub client_notes: Option<String>,
	/// User id of the office actor who created the order.
	pub created_by: String,
	/// Worker currently claiming the order. Set only in processing statuses.
	pub current_holder: Option<String>,
	/// Worker whose claim most recently ended.
	pub previous_holder: Option<String>,
	pub claimed_at: Option<DateTime<Utc>>,
	/// Deadline after which the claim reverts to the pool.
	pub timeout_at: Option<DateTime<Utc>>,
	/// Set by the printer on final completion.
	pub tracking_number: Option<String>,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

/// Roles allowed to see client contact details.
const PII_ROLES: [Role; 3] = [Role::Administrator, Role::OfficeEmployee, Role::QualityControl];

impl Order {
	/// Returns a copy with client details removed unless `roles` may see them.
	pub fn redacted_for(&self, roles: &RoleSet) -> Order {
		let mut order = self.clone();
		if !roles.intersects(&PII_ROLES) {
			order.client_name = None;
			order.client_email = None;
			order.client_phone = None;
			order.client_notes = None;
		}
		order
	}

	/// Drops the active claim, remembering who held it.
	pub fn release_claim(&mut self) {
		if let Some(holder) = self.current_holder.take() {
			self.previous_holder = Some(holder);
		}
		self.claimed_at = None;
		self.timeout_at = None;
	}
}

/// Input for creating a new order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewOrder {
	pub product_type: String,
	pub client_name: String,
	pub client_email: Option<String>,
	pub client_phone: Option<String>,
	pub client_notes: Option<String>,
}

/// One row of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderHistoryEntry {
	pub id: String,
	pub order_id: String,
	pub from_status: OrderStatus,
	pub to_status: OrderStatus,
	pub action: Action,
	/// `None` when the system performed the action.
	pub actor_id: Option<String>,
	pub notes: Option<String>,
	pub created_at: DateTime<Utc>,
}

/// How a claim ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
	Completed,
	Rejected,
	TimedOut,
	Cancelled,
}

/// Reporting row for a single claim by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkStatistic {
	pub id: String,
	pub worker_id: String,
	pub order_id: String,
	pub role: Role,
	pub stage: Stage,
	pub claimed_at: DateTime<Utc>,
	pub completed_at: Option<DateTime<Utc>>,
	pub duration_seconds: Option<i64>,
	pub was_rejected: bool,
	pub outcome: Option<ClaimOutcome>,
}

impl WorkStatistic {
	pub fn is_open(&self) -> bool {
		self.completed_at.is_none()
	}

	/// Closes the row at `now` with the given outcome.
	pub fn close(&mut self, outcome: ClaimOutcome, now: DateTime<Utc>) {
		self.completed_at = Some(now);
		self.duration_seconds = Some((now - self.claimed_at).num_seconds().max(0));
		self.was_rejected = outcome == ClaimOutcome::Rejected;
		self.outcome = Some(outcome);
	}
}

/// The persisted unit: an order with its history and statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
	pub order: Order,
	#[serde(default)]
	pub history: Vec<OrderHistoryEntry>,
	#[serde(default)]
	pub statistics: Vec<WorkStatistic>,
}

impl OrderRecord {
	/// The statistic row of the claim currently in progress, if any.
	pub fn open_statistic_mut(&mut self) -> Option<&mut WorkStatistic> {
		self.statistics.iter_mut().rev().find(|stat| stat.is_open())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn order() -> Order {
		let now = Utc::now();
		Order {
			id: "order-1".into(),
			order_number: "ZL-2026-0001".into(),
			status: OrderStatus::EditorProcessing,
			product_type: "book".into(),
			client_name: Some("Jane".into()),
			client_email: Some("jane@example.com".into()),
			client_phone: None,
			client_notes: Some("rush".into()),
			created_by: "office-1".into(),
			current_holder: Some("editor-1".into()),
			previous_holder: None,
			claimed_at: Some(now),
			timeout_at: Some(now),
			tracking_number: None,
			created_at: now,
			updated_at: now,
		}
	}

	#[test]
	fn test_status_classification() {
		let processing: Vec<_> = OrderStatus::all().filter(|s| s.is_processing()).collect();
		assert_eq!(
			processing,
			vec![
				OrderStatus::EditorProcessing,
				OrderStatus::IllustratorProcessing,
				OrderStatus::DesignerProcessing,
				OrderStatus::PrinterProcessing,
			]
		);
		assert_eq!(OrderStatus::all().filter(|s| s.is_pool()).count(), 4);
		assert_eq!(OrderStatus::all().filter(|s| s.is_qc_review()).count(), 3);
		assert_eq!(OrderStatus::all().filter(|s| s.is_rework()).count(), 3);
		assert_eq!(OrderStatus::all().filter(|s| !s.is_terminal()).count(), 16);
	}

	#[test]
	fn test_status_wire_names() {
		for status in OrderStatus::all() {
			assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
			assert_eq!(
				serde_json::to_value(status).unwrap(),
				serde_json::Value::String(status.to_string())
			);
		}
	}

	#[test]
	fn test_redaction_hides_client_fields() {
		let order = order();

		let redacted = order.redacted_for(&RoleSet::new([Role::Editor]));
		assert_eq!(redacted.client_name, None);
		assert_eq!(redacted.client_email, None);
		assert_eq!(redacted.client_notes, None);
		assert_eq!(redacted.product_type, "book");

		let visible = order.redacted_for(&RoleSet::new([Role::Editor, Role::QualityControl]));
		assert_eq!(visible, order);
	}

	#[test]
	fn test_release_claim_moves_holder() {
		let mut order = order();
		order.release_claim();
		assert_eq!(order.current_holder, None);
		assert_eq!(order.previous_holder.as_deref(), Some("editor-1"));
		assert_eq!(order.claimed_at, None);
		assert_eq!(order.timeout_at, None);
	}

	#[test]
	fn test_statistic_close() {
		let claimed_at = Utc::now() - chrono::Duration::seconds(90);
		let mut stat = WorkStatistic {
			id: "s-1".into(),
			worker_id: "editor-1".into(),
			order_id: "order-1".into(),
			role: Role::Editor,
			stage: Stage::Editor,
			claimed_at,
			completed_at: None,
			duration_seconds: None,
			was_rejected: false,
			outcome: None,
		};
		assert!(stat.is_open());

		stat.close(ClaimOutcome::Rejected, claimed_at + chrono::Duration::seconds(90));
		assert!(!stat.is_open());
		assert!(stat.was_rejected);
		assert_eq!(stat.duration_seconds, Some(90));
	}
}
