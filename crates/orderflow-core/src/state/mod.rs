//! State management for orders.
//!
//! The transition table decides which status changes are legal; the order
//! store persists records and applies changes atomically per order.

pub mod store;
pub mod transitions;

pub use store::OrderStore;
pub use transitions::TransitionTable;
