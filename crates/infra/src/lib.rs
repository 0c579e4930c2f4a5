//! Infrastructure layer: relational catalog, role cache, config, and the
//! coordinator that keeps them consistent with the policy engine.

pub mod authorization;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod invalidation;

pub use authorization::{AuthorizeError, Authorizer};
pub use coordinator::{AuthorizationCoordinator, CoordinatorError};
pub use invalidation::{InvalidationScheduler, InvalidationStats};
