use serde::{Deserialize, Serialize};

use super::engine::EngineError;

/// Rule kind tag as stored in the `ptype` column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    /// Permission rule: `(role_name, path, method)`.
    P,
    /// Grouping rule: `(user_identifier, role_name)`.
    G,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P => "p",
            Self::G => "g",
        }
    }
}

impl core::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the policy projection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "ptype", rename_all = "lowercase")]
pub enum PolicyRule {
    #[serde(rename = "p")]
    Permission {
        role: String,
        path: String,
        method: String,
    },
    #[serde(rename = "g")]
    Grouping { member: String, role: String },
}

impl PolicyRule {
    pub fn permission(
        role: impl Into<String>,
        path: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self::Permission {
            role: role.into(),
            path: path.into(),
            method: method.into(),
        }
    }

    pub fn grouping(member: impl Into<String>, role: impl Into<String>) -> Self {
        Self::Grouping {
            member: member.into(),
            role: role.into(),
        }
    }

    pub fn ptype(&self) -> PolicyType {
        match self {
            Self::Permission { .. } => PolicyType::P,
            Self::Grouping { .. } => PolicyType::G,
        }
    }

    /// Flatten into the `(ptype, v0, v1, v2)` storage columns.
    pub fn to_columns(&self) -> (PolicyType, &str, &str, Option<&str>) {
        match self {
            Self::Permission { role, path, method } => {
                (PolicyType::P, role, path, Some(method.as_str()))
            }
            Self::Grouping { member, role } => (PolicyType::G, member, role, None),
        }
    }

    /// Rebuild a rule from storage columns.
    pub fn from_columns(
        ptype: &str,
        v0: String,
        v1: String,
        v2: Option<String>,
    ) -> Result<Self, EngineError> {
        match ptype {
            "p" => {
                let method = v2
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| EngineError::MalformedRule(format!("p rule for '{v0}' has no method")))?;
                Ok(Self::permission(v0, v1, method))
            }
            "g" => Ok(Self::grouping(v0, v1)),
            other => Err(EngineError::MalformedRule(format!("unknown ptype '{other}'"))),
        }
    }
}
