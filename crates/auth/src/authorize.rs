use serde::Serialize;

use crate::policy::{EngineError, PolicyEngine};
use crate::role_set::RoleSet;

/// Outcome of checking a request against a user's roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RoleDecision {
    /// `role` holds a rule matching the request.
    Allow { role: String },
    Deny(DenyReason),
}

impl RoleDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    /// The user holds no roles at all.
    NoRoles,
    /// Every role was evaluated and none matched.
    NoMatchingRule,
    /// No role matched and the evaluator failed for these roles.
    EvaluatorFailure { roles: Vec<String> },
}

/// Per-role policy check used by [`evaluate_roles`].
pub trait RoleEvaluator {
    fn enforce(&self, role: &str, path: &str, method: &str) -> Result<bool, EngineError>;
}

impl RoleEvaluator for PolicyEngine {
    fn enforce(&self, role: &str, path: &str, method: &str) -> Result<bool, EngineError> {
        PolicyEngine::enforce(self, role, path, method)
    }
}

/// Check `path`/`method` against each role in turn.
///
/// - No IO
/// - Short-circuits on the first allowing role
/// - An evaluator error only disqualifies the role it happened on
pub fn evaluate_roles<E>(engine: &E, roles: &RoleSet, path: &str, method: &str) -> RoleDecision
where
    E: RoleEvaluator + ?Sized,
{
    if roles.is_empty() {
        return RoleDecision::Deny(DenyReason::NoRoles);
    }

    let mut failed = Vec::new();
    for role in roles.names() {
        match engine.enforce(role, path, method) {
            Ok(true) => {
                return RoleDecision::Allow {
                    role: role.to_string(),
                };
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(role, path, method, error = %err, "policy evaluation failed; role treated as deny");
                failed.push(role.to_string());
            }
        }
    }

    if failed.is_empty() {
        RoleDecision::Deny(DenyReason::NoMatchingRule)
    } else {
        RoleDecision::Deny(DenyReason::EvaluatorFailure { roles: failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyModel;

    /// Fails for every role in `broken`, allows `allowed` on any request.
    struct Scripted {
        broken: Vec<&'static str>,
        allowed: Vec<&'static str>,
    }

    impl RoleEvaluator for Scripted {
        fn enforce(&self, role: &str, _path: &str, _method: &str) -> Result<bool, EngineError> {
            if self.broken.contains(&role) {
                return Err(EngineError::Evaluation(format!("cannot evaluate '{role}'")));
            }
            Ok(self.allowed.contains(&role))
        }
    }

    async fn engine() -> PolicyEngine {
        PolicyEngine::new(PolicyModel::default()).await.unwrap()
    }

    #[tokio::test]
    async fn empty_role_set_is_denied_without_evaluation() {
        let engine = engine().await;
        engine.add_policy("anyone", "/*", "*").await.unwrap();

        let decision = evaluate_roles(&engine, &RoleSet::Empty, "/docs", "GET");
        assert_eq!(decision, RoleDecision::Deny(DenyReason::NoRoles));
    }

    #[tokio::test]
    async fn first_matching_role_allows() {
        let engine = engine().await;
        engine.add_policy("editor", "/docs/*", "GET").await.unwrap();

        let roles = RoleSet::from_names(["auditor", "editor"]);
        let decision = evaluate_roles(&engine, &roles, "/docs/123", "GET");
        assert_eq!(decision, RoleDecision::Allow { role: "editor".into() });

        let decision = evaluate_roles(&engine, &roles, "/docs/123", "DELETE");
        assert_eq!(decision, RoleDecision::Deny(DenyReason::NoMatchingRule));
    }

    #[test]
    fn evaluator_error_on_one_role_does_not_abort_the_check() {
        let evaluator = Scripted {
            broken: vec!["broken"],
            allowed: vec!["writer"],
        };

        let roles = RoleSet::from_names(["broken", "writer"]);
        assert!(evaluate_roles(&evaluator, &roles, "/docs", "POST").is_allowed());
    }

    #[test]
    fn errors_on_every_role_fail_closed() {
        let evaluator = Scripted {
            broken: vec!["a", "b"],
            allowed: vec![],
        };

        let roles = RoleSet::from_names(["a", "b"]);
        let decision = evaluate_roles(&evaluator, &roles, "/docs", "GET");
        assert_eq!(
            decision,
            RoleDecision::Deny(DenyReason::EvaluatorFailure {
                roles: vec!["a".into(), "b".into()]
            })
        );
    }
}
