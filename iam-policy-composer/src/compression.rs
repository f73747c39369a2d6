//! Normalization and quota validation of a composed policy bundle
//!
//! Compression never merges, splits, or reorders documents: the position of
//! every rendered and synthesized document is part of the composer's output.
//! It fills in missing versions, drops duplicate entries within statements,
//! and rejects bundles that IAM would refuse.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::composer::Policy;
use crate::document::{PolicyDocument, Statement, IAM_POLICY_VERSION};

/// Managed policy document size quota, in characters
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 6144;

/// Role trust policy size quota, in characters
pub const DEFAULT_MAX_ASSUME_ROLE_POLICY_SIZE: usize = 2048;

/// Managed policies attachable to one principal
pub const DEFAULT_MAX_DOCUMENTS_PER_ACCOUNT: usize = 20;

/// Quotas applied by [`Policy::compress`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CompressionLimits {
    pub max_document_size: usize,
    pub max_assume_role_policy_size: usize,
    pub max_documents_per_account: usize,
}

impl Default for CompressionLimits {
    fn default() -> Self {
        Self {
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            max_assume_role_policy_size: DEFAULT_MAX_ASSUME_ROLE_POLICY_SIZE,
            max_documents_per_account: DEFAULT_MAX_DOCUMENTS_PER_ACCOUNT,
        }
    }
}

/// Why a composed bundle was rejected
#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("{location}: statement {index} {reason}")]
    InvalidStatement {
        location: String,
        index: usize,
        reason: &'static str,
    },

    #[error("{location}: document is {size} characters, limit is {limit}")]
    DocumentTooLarge {
        location: String,
        size: usize,
        limit: usize,
    },

    #[error("account '{account}': {count} policy documents, limit is {limit}")]
    TooManyDocuments {
        account: String,
        count: usize,
        limit: usize,
    },

    #[error("{location}: {source}")]
    Serialization {
        location: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Policy {
    /// Normalize every document in place, then validate the bundle against
    /// `limits`. Placeholder documents are left untouched.
    pub fn compress(&mut self, limits: &CompressionLimits) -> Result<(), CompressionError> {
        for (account, documents) in &mut self.account_policies {
            let count = documents.iter().filter(|d| !d.is_placeholder()).count();
            if count > limits.max_documents_per_account {
                return Err(CompressionError::TooManyDocuments {
                    account: account.clone(),
                    count,
                    limit: limits.max_documents_per_account,
                });
            }

            for (index, document) in documents.iter_mut().enumerate() {
                let location = format!("account '{account}' policy {index}");
                compress_document(document, &location, limits.max_document_size, false)?;
            }
        }

        for (account, documents) in &mut self.account_role_policies {
            for (index, document) in documents.iter_mut().enumerate() {
                let location = format!("account '{account}' role policy {index}");
                compress_document(document, &location, limits.max_document_size, false)?;
            }
        }

        for (account, roles) in &mut self.service_role_policies {
            for (role, policies) in roles.iter_mut() {
                let location = format!("account '{account}' service role '{role}'");
                compress_document(
                    &mut policies.policy,
                    &location,
                    limits.max_document_size,
                    false,
                )?;
                compress_document(
                    &mut policies.assume_role_policy,
                    &format!("{location} trust policy"),
                    limits.max_assume_role_policy_size,
                    true,
                )?;
            }
        }

        Ok(())
    }
}

fn compress_document(
    document: &mut PolicyDocument,
    location: &str,
    max_size: usize,
    trust_policy: bool,
) -> Result<(), CompressionError> {
    if document.is_placeholder() {
        return Ok(());
    }

    if document.version.is_empty() {
        document.version = IAM_POLICY_VERSION.to_string();
    }

    for (index, statement) in document.statement.iter_mut().enumerate() {
        dedup_in_place(&mut statement.action);
        dedup_in_place(&mut statement.not_action);
        dedup_in_place(&mut statement.resource);
        dedup_in_place(&mut statement.not_resource);

        if let Some(reason) = statement_defect(statement, trust_policy) {
            return Err(CompressionError::InvalidStatement {
                location: location.to_string(),
                index,
                reason,
            });
        }
    }

    let size = document
        .to_json()
        .map_err(|source| CompressionError::Serialization {
            location: location.to_string(),
            source,
        })?
        .chars()
        .filter(|c| !c.is_whitespace())
        .count();

    if size > max_size {
        return Err(CompressionError::DocumentTooLarge {
            location: location.to_string(),
            size,
            limit: max_size,
        });
    }

    Ok(())
}

fn statement_defect(statement: &Statement, trust_policy: bool) -> Option<&'static str> {
    match (statement.action.is_empty(), statement.not_action.is_empty()) {
        (true, true) => return Some("has neither Action nor NotAction"),
        (false, false) => return Some("has both Action and NotAction"),
        _ => {}
    }

    if statement.principal.is_some() && statement.not_principal.is_some() {
        return Some("has both Principal and NotPrincipal");
    }

    if trust_policy {
        return statement.principal.is_none().then_some("has no Principal");
    }

    match (statement.resource.is_empty(), statement.not_resource.is_empty()) {
        (true, true) => Some("has neither Resource nor NotResource"),
        (false, false) => Some("has both Resource and NotResource"),
        _ => None,
    }
}

/// Remove repeated entries, keeping the first occurrence of each
fn dedup_in_place(values: &mut Vec<String>) {
    let mut seen = HashSet::new();
    values.retain(|value| seen.insert(value.clone()));
}
