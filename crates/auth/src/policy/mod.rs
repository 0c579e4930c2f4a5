//! In-memory policy evaluation on top of casbin.
//!
//! Rules are projected from the relational catalog into two kinds:
//! permission rules `p(role, path, method)` and grouping rules
//! `g(member, role)`. The [`PolicyEngine`] loads them into a casbin
//! enforcer that is replaced wholesale on reload.

pub mod engine;
pub mod model;
pub mod rule;

pub use engine::{EngineError, PolicyEngine, PolicySource, RuleIndex};
pub use model::{DEFAULT_MATCHER, PolicyModel};
pub use rule::{PolicyRule, PolicyType};
