//! `warden-auth`: storage-free authorization model and policy engine.
//!
//! This crate is intentionally decoupled from HTTP, SQL and Redis. Rules are
//! pulled into the engine through the [`PolicySource`] seam; everything else
//! is pure data plus the casbin-backed evaluator.

pub mod authorize;
pub mod claims;
pub mod permissions;
pub mod policy;
pub mod principal;
pub mod role_set;
pub mod roles;
pub mod users;

pub use authorize::{DenyReason, RoleDecision, RoleEvaluator, evaluate_roles};
pub use claims::{Hs256JwtValidator, JwtClaims, JwtValidator, TokenValidationError, validate_claims};
pub use permissions::{NewPermission, Permission, normalize_method};
pub use policy::{
    EngineError, PolicyEngine, PolicyModel, PolicyRule, PolicySource, PolicyType, RuleIndex,
};
pub use principal::Principal;
pub use role_set::{EMPTY_ROLE_SENTINEL, RoleSet};
pub use roles::{Role, validate_role_name};
pub use users::{USER_SUBJECT_PREFIX, User, user_subject, validate_user_name};
