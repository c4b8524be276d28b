//! Workflow vocabulary shared by the engine and its callers.
//!
//! Defines the production stages an order passes through, the actions that
//! move it between statuses, the roles workers hold, and the actor on whose
//! behalf an action is performed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::OrderStatus;

/// A production stage. Stages run in the fixed order
/// editor -> illustrator -> designer -> printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
	Editor,
	Illustrator,
	Designer,
	Printer,
}

impl Stage {
	/// Returns every stage in production order.
	pub fn all() -> impl Iterator<Item = Self> {
		[Self::Editor, Self::Illustrator, Self::Designer, Self::Printer].into_iter()
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Stage::Editor => "editor",
			Stage::Illustrator => "illustrator",
			Stage::Designer => "designer",
			Stage::Printer => "printer",
		}
	}

	/// The stage that follows this one, if any.
	pub fn next(&self) -> Option<Stage> {
		match self {
			Stage::Editor => Some(Stage::Illustrator),
			Stage::Illustrator => Some(Stage::Designer),
			Stage::Designer => Some(Stage::Printer),
			Stage::Printer => None,
		}
	}

	/// The role whose workers claim orders in this stage.
	pub fn role(&self) -> Role {
		match self {
			Stage::Editor => Role::Editor,
			Stage::Illustrator => Role::Illustrator,
			Stage::Designer => Role::GraphicDesigner,
			Stage::Printer => Role::Printer,
		}
	}

	pub fn pool(&self) -> OrderStatus {
		match self {
			Stage::Editor => OrderStatus::EditorPool,
			Stage::Illustrator => OrderStatus::IllustratorPool,
			Stage::Designer => OrderStatus::DesignerPool,
			Stage::Printer => OrderStatus::PrinterPool,
		}
	}

	pub fn processing(&self) -> OrderStatus {
		match self {
			Stage::Editor => OrderStatus::EditorProcessing,
			Stage::Illustrator => OrderStatus::IllustratorProcessing,
			Stage::Designer => OrderStatus::DesignerProcessing,
			Stage::Printer => OrderStatus::PrinterProcessing,
		}
	}

	/// The QC review gate after this stage. The printer stage has none.
	pub fn qc_review(&self) -> Option<OrderStatus> {
		match self {
			Stage::Editor => Some(OrderStatus::QcEditorReview),
			Stage::Illustrator => Some(OrderStatus::QcIllustratorReview),
			Stage::Designer => Some(OrderStatus::QcDesignerReview),
			Stage::Printer => None,
		}
	}

	/// The rework state entered on QC rejection. The printer stage has none.
	pub fn rework(&self) -> Option<OrderStatus> {
		match self {
			Stage::Editor => Some(OrderStatus::EditorRework),
			Stage::Illustrator => Some(OrderStatus::IllustratorRework),
			Stage::Designer => Some(OrderStatus::DesignerRework),
			Stage::Printer => None,
		}
	}
}

impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Actions an actor can perform on an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
	/// Recorded in history when an order is created. Never a transition.
	Create,
	Submit,
	Claim,
	Complete,
	Reject,
	Approve,
	Cancel,
	Timeout,
}

impl Action {
	/// Returns every action, including the history-only `Create`.
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Create,
			Self::Submit,
			Self::Claim,
			Self::Complete,
			Self::Reject,
			Self::Approve,
			Self::Cancel,
			Self::Timeout,
		]
		.into_iter()
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Action::Create => "create",
			Action::Submit => "submit",
			Action::Claim => "claim",
			Action::Complete => "complete",
			Action::Reject => "reject",
			Action::Approve => "approve",
			Action::Cancel => "cancel",
			Action::Timeout => "timeout",
		}
	}
}

impl fmt::Display for Action {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Action {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Action::all()
			.find(|action| action.as_str() == s)
			.ok_or_else(|| format!("unknown action '{}'", s))
	}
}

/// Roles a user can hold. A user may hold several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Administrator,
	OfficeEmployee,
	Editor,
	Illustrator,
	GraphicDesigner,
	Printer,
	QualityControl,
}

impl Role {
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Administrator,
			Self::OfficeEmployee,
			Self::Editor,
			Self::Illustrator,
			Self::GraphicDesigner,
			Self::Printer,
			Self::QualityControl,
		]
		.into_iter()
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Role::Administrator => "administrator",
			Role::OfficeEmployee => "office_employee",
			Role::Editor => "editor",
			Role::Illustrator => "illustrator",
			Role::GraphicDesigner => "graphic_designer",
			Role::Printer => "printer",
			Role::QualityControl => "quality_control",
		}
	}

	/// The production stage worked by this role, if it is a production role.
	pub fn stage(&self) -> Option<Stage> {
		Stage::all().find(|stage| stage.role() == *self)
	}
}

impl fmt::Display for Role {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Role {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Role::all()
			.find(|role| role.as_str() == s)
			.ok_or_else(|| format!("unknown role '{}'", s))
	}
}

/// The set of roles held by an actor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet(BTreeSet<Role>);

impl RoleSet {
	pub fn new(roles: impl IntoIterator<Item = Role>) -> Self {
		Self(roles.into_iter().collect())
	}

	pub fn contains(&self, role: Role) -> bool {
		self.0.contains(&role)
	}

	/// True when at least one role is shared with `allowed`.
	pub fn intersects(&self, allowed: &[Role]) -> bool {
		allowed.iter().any(|role| self.0.contains(role))
	}

	pub fn iter(&self) -> impl Iterator<Item = Role> + '_ {
		self.0.iter().copied()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromIterator<Role> for RoleSet {
	fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
		Self::new(iter)
	}
}

impl FromStr for RoleSet {
	type Err = String;

	/// Parses a comma separated list such as `editor,illustrator`.
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		s.split(',')
			.map(str::trim)
			.filter(|part| !part.is_empty())
			.map(Role::from_str)
			.collect()
	}
}

/// Who performs an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Actor {
	/// An authenticated user with their role set.
	User { id: String, roles: RoleSet },
	/// The scheduler acting on its own behalf (timeouts).
	System,
}

impl Actor {
	pub fn user(id: impl Into<String>, roles: impl IntoIterator<Item = Role>) -> Self {
		Actor::User {
			id: id.into(),
			roles: RoleSet::new(roles),
		}
	}

	/// The user id recorded in history; `None` for the system actor.
	pub fn id(&self) -> Option<&str> {
		match self {
			Actor::User { id, .. } => Some(id),
			Actor::System => None,
		}
	}

	pub fn roles(&self) -> Option<&RoleSet> {
		match self {
			Actor::User { roles, .. } => Some(roles),
			Actor::System => None,
		}
	}
}
