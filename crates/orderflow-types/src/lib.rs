//! Common types module for the orderflow workflow system.
//!
//! This module defines the core data types shared by every orderflow crate:
//! orders and their statuses, workflow actions, roles and actors, the audit
//! records written alongside each transition, and the configuration
//! validation framework used by pluggable implementations.

/// Order records, statuses, history and work statistics.
pub mod order;
/// Implementation registry trait for pluggable backends.
pub mod registry;
/// Storage namespaces.
pub mod storage;
/// Utility functions for log formatting.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;
/// Workflow vocabulary: stages, actions, roles and actors.
pub mod workflow;

pub use order::*;
pub use registry::ImplementationRegistry;
pub use storage::*;
pub use utils::truncate_id;
pub use validation::*;
pub use workflow::*;
