//! Core workflow engine for the orderflow system.
//!
//! This crate routes production orders through the editor, illustrator,
//! designer and printer stages. It provides the transition table that
//! defines every legal status change, the order store that applies changes
//! atomically per order, the claim coordinator that keeps one worker per
//! order and one order per worker, the timeout scheduler that returns
//! abandoned claims to their pool, and the orchestrator that callers use to
//! perform actions.

use orderflow_types::{Action, OrderStatus};
use thiserror::Error;

pub mod builder;
pub mod claims;
pub mod clock;
pub mod engine;
pub mod orchestrator;
pub mod scheduler;
pub mod state;

pub use builder::{BuilderError, WorkflowBuilder};
pub use claims::ClaimCoordinator;
pub use clock::{Clock, SystemClock, TokioClock};
pub use engine::{EngineError, WorkflowEngine};
pub use orchestrator::{ActionPayload, WorkflowOrchestrator};
pub use scheduler::{FireOutcome, SweepReport, TimeoutScheduler};
pub use state::{OrderStore, TransitionTable};

/// Errors returned by workflow operations.
///
/// Every variant except `StorageUnavailable` is a final answer for the
/// request; a `StorageUnavailable` request made no change and may be retried.
#[derive(Debug, Error)]
pub enum WorkflowError {
	#[error("Order not found: {0}")]
	NotFound(String),
	/// The actor's roles or ownership do not permit the action.
	#[error("Forbidden: {0}")]
	Forbidden(String),
	#[error("Action '{action}' is not valid for an order in status '{status}'")]
	InvalidTransition { status: OrderStatus, action: Action },
	#[error("Order is not in a pool this worker can claim from (status '{status}')")]
	NotInPool { status: OrderStatus },
	#[error("Order {0} is already claimed")]
	AlreadyClaimed(String),
	#[error("Worker {worker_id} is still working on order {order_id}")]
	WorkerBusy { worker_id: String, order_id: String },
	#[error("Storage unavailable: {0}")]
	StorageUnavailable(String),
	/// Malformed input to order creation.
	#[error("Validation error: {0}")]
	Validation(String),
}
