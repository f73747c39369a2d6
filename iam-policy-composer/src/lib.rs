//! This crate provides the core of IAM Policy Composer:
//! - A process-wide registry of policy templates and accounts
//! - Containers that attach templates to accounts with variable bindings
//! - Composition of a default-deny policy bundle per account
//! - Normalization and quota validation of the composed bundle
//!
//! Lock order is fixed: the registry lock is always taken before a container
//! lock, so any mix of registrations, attachments, and compositions across
//! containers is deadlock free.

mod composer;
mod compression;
mod config;
mod container;
pub mod document;
mod error;
mod registry;
pub mod template;

// Re-exports for a small, focused public API
pub use composer::{ComposedPolicy, Policy, ServiceRolePolicy};
pub use compression::{
    CompressionError, CompressionLimits, DEFAULT_MAX_ASSUME_ROLE_POLICY_SIZE,
    DEFAULT_MAX_DOCUMENTS_PER_ACCOUNT, DEFAULT_MAX_DOCUMENT_SIZE,
};
pub use config::ComposerConfig;
pub use container::{Attachment, Container};
pub use document::{Effect, PolicyDocument, Statement, IAM_POLICY_VERSION};
pub use error::{ComposerError, ComposerResult};
pub use registry::{Account, Registry, RegistryId};
pub use template::{
    DocumentTemplate, PolicyTemplate, RenderContext, RenderError, ServiceRole, TemplateBinding,
    TemplateRenderer,
};
