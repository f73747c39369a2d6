//! IAM policy document model
//!
//! Documents produced by template renderers and the statements the composer
//! synthesizes around them. Serialization follows the AWS IAM JSON grammar
//! (`Version`, `Statement`, `Sid`, `Effect`, `Action`/`NotAction`, `Resource`).

use serde::{Deserialize, Deserializer, Serialize};

/// The only policy language version accepted from rendered templates.
pub const IAM_POLICY_VERSION: &str = "2012-10-17";

/// Wildcard matching every action or every resource.
pub const WILDCARD: &str = "*";

/// Effect of a policy statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Effect {
    Allow,
    Deny,
}

/// A single policy statement
///
/// Unknown keys are rejected rather than dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Statement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    pub effect: Effect,

    /// Trust policy principal, only present on assume-role documents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_principal: Option<serde_json::Value>,

    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub action: Vec<String>,

    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub not_action: Vec<String>,

    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub resource: Vec<String>,

    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub not_resource: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<serde_json::Value>,
}

impl Statement {
    /// Create a statement granting or denying `action` on `resource`
    pub fn new(effect: Effect, action: Vec<String>, resource: Vec<String>) -> Self {
        Self {
            sid: None,
            effect,
            principal: None,
            not_principal: None,
            action,
            not_action: Vec::new(),
            resource,
            not_resource: Vec::new(),
            condition: None,
        }
    }

    #[must_use]
    pub fn with_sid(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    /// `AllowAll`: every action on every resource.
    pub fn allow_all() -> Self {
        Self::new(
            Effect::Allow,
            vec![WILDCARD.to_string()],
            vec![WILDCARD.to_string()],
        )
        .with_sid("AllowAll")
    }

    /// `DenyAll`: used for accounts whose attached templates grant no scope.
    pub fn deny_all() -> Self {
        Self::new(
            Effect::Deny,
            vec![WILDCARD.to_string()],
            vec![WILDCARD.to_string()],
        )
        .with_sid("DenyAll")
    }

    /// `DenyUnknownServices`: deny every action outside `scope`.
    ///
    /// The scope is emitted in the order given; callers pass it sorted.
    pub fn deny_unless_in_scope(scope: Vec<String>) -> Self {
        Self {
            sid: Some("DenyUnknownServices".to_string()),
            effect: Effect::Deny,
            principal: None,
            not_principal: None,
            action: Vec::new(),
            not_action: scope,
            resource: vec![WILDCARD.to_string()],
            not_resource: Vec::new(),
            condition: None,
        }
    }
}

/// Complete IAM policy document
///
/// `PolicyDocument::default()` is the empty placeholder the composer emits for
/// templates that rendered nothing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub statement: Vec<Statement>,
}

impl PolicyDocument {
    /// Create a versioned document holding `statements`
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            version: IAM_POLICY_VERSION.to_string(),
            id: None,
            statement: statements,
        }
    }

    /// Wrap a single synthesized statement in its own document
    pub fn single(statement: Statement) -> Self {
        Self::new(vec![statement])
    }

    /// True for the empty document emitted in place of a missing render
    pub fn is_placeholder(&self) -> bool {
        self.version.is_empty() && self.id.is_none() && self.statement.is_empty()
    }

    /// Minified JSON form, the size IAM quotas are measured against
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Accept either `"s3:GetObject"` or `["s3:GetObject", ...]`
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}
