//! Error types for registration, attachment, and policy composition

use thiserror::Error;

use crate::compression::CompressionError;
use crate::template::RenderError;

/// Errors surfaced by the registry, containers, and the composer.
///
/// Registration and attachment errors leave all state unchanged. Render,
/// version, and compression errors abort the whole composition.
#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("policy template '{key}' already exists")]
    DuplicateTemplate { key: String },

    #[error("account '{name}' already exists")]
    DuplicateAccount { name: String },

    #[error("policy template '{key}' is in unknown state: already bound to a registry")]
    InvalidTemplateState { key: String },

    #[error("cannot add attachment, unknown policy template '{key}' in container '{container}'")]
    UnknownTemplate { key: String, container: String },

    #[error("cannot add attachment, unknown account '{name}' in container '{container}'")]
    UnknownAccount { name: String, container: String },

    #[error(
        "cannot add attachment of '{template}', variable '{variable}' is not set in container '{container}'"
    )]
    MissingVariable {
        variable: String,
        template: String,
        container: String,
    },

    /// Propagated unchanged from the template renderer
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("unsupported policy version '{version}'")]
    UnsupportedVersion { version: String },

    #[error("policy compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("failed to serialize policy: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ComposerError {
    pub(crate) fn unknown_template(key: &str, container: &str) -> Self {
        Self::UnknownTemplate {
            key: key.to_string(),
            container: container.to_string(),
        }
    }

    pub(crate) fn unknown_account(name: &str, container: &str) -> Self {
        Self::UnknownAccount {
            name: name.to_string(),
            container: container.to_string(),
        }
    }

    pub(crate) fn missing_variable(variable: &str, template: &str, container: &str) -> Self {
        Self::MissingVariable {
            variable: variable.to_string(),
            template: template.to_string(),
            container: container.to_string(),
        }
    }
}

pub type ComposerResult<T> = Result<T, ComposerError>;
