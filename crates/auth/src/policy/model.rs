use casbin::DefaultModel;

use super::engine::EngineError;

/// The matcher shipped by default: role grouping, path patterns, method wildcards.
pub const DEFAULT_MATCHER: &str =
    "g(r.sub, p.sub) && keyMatch2(r.obj, p.obj) && keyMatch(r.act, p.act)";

const MODEL_HEAD: &str = r#"
[request_definition]
r = sub, obj, act

[policy_definition]
p = sub, obj, act

[role_definition]
g = _, _

[policy_effect]
e = some(where (p.eft == allow))

[matchers]
"#;

/// Casbin model text the engine builds its enforcers from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyModel {
    conf: String,
}

impl Default for PolicyModel {
    fn default() -> Self {
        Self::with_matcher(DEFAULT_MATCHER)
    }
}

impl PolicyModel {
    /// The standard RBAC definitions with a custom `m = ...` line.
    pub fn with_matcher(expr: &str) -> Self {
        Self {
            conf: format!("{MODEL_HEAD}m = {expr}\n"),
        }
    }

    /// A complete model in casbin's config format.
    pub fn from_conf(conf: impl Into<String>) -> Self {
        Self { conf: conf.into() }
    }

    pub fn conf(&self) -> &str {
        &self.conf
    }

    pub(crate) async fn parse(&self) -> Result<DefaultModel, EngineError> {
        DefaultModel::from_str(&self.conf)
            .await
            .map_err(|err| EngineError::InvalidModel(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_model_parses() {
        let model = PolicyModel::default();
        assert!(model.conf().contains(DEFAULT_MATCHER));
        model.parse().await.unwrap();
    }

    #[tokio::test]
    async fn model_without_policy_definition_is_rejected() {
        let model = PolicyModel::from_conf("[request_definition]\nr = sub, obj, act\n");
        assert!(matches!(model.parse().await, Err(EngineError::InvalidModel(_))));
    }
}
