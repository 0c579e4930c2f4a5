//! `warden-core`: shared primitives for the authorization engine.
//!
//! This crate contains **pure** building blocks (no storage, cache or HTTP).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{PermissionId, RoleId, UserId};
