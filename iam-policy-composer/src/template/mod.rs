//! Policy templates and the renderer seam
//!
//! A [`PolicyTemplate`] carries the metadata the composer reads directly
//! (required variables, scope, optional service role) and delegates document
//! production to a [`TemplateRenderer`]. Templates become shared and immutable
//! once registered; the [`TemplateBinding`] stamped at registration is how a
//! second registration of the same template is detected.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::PolicyDocument;
use crate::registry::{Account, RegistryId};

pub mod document_template;

pub use document_template::DocumentTemplate;

/// Secondary role a template provisions alongside its account policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRole {
    /// Role name, unique per account in the composed output
    pub name: String,
    /// Service principal trusted to assume the role (e.g. `lambda.amazonaws.com`)
    pub service: String,
}

impl ServiceRole {
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
        }
    }
}

/// Ownership marker set exactly once, when a template is registered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateBinding {
    pub registry: RegistryId,
    pub container: String,
}

/// Everything a renderer may use to produce a document for one attachment
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub template: &'a str,
    pub container: &'a str,
    pub account: &'a Account,
    pub vars: &'a BTreeMap<String, String>,
    pub service_role: Option<&'a ServiceRole>,
}

/// Errors produced while rendering a template
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("policy template '{template}': unresolved placeholder '${{{name}}}'")]
    UnresolvedPlaceholder { template: String, name: String },

    #[error("policy template '{template}' rendered an invalid policy document: {source}")]
    InvalidDocument {
        template: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("policy template '{template}' declares no service role")]
    NoServiceRole { template: String },

    #[error("policy template '{template}' has no policy for service role '{role}'")]
    MissingServiceRoleBody { template: String, role: String },

    #[error("policy template '{template}' failed to render: {message}")]
    Failed { template: String, message: String },
}

/// Produces policy documents for a template.
///
/// `render` returning `Ok(None)` means the template intentionally has nothing
/// for this context; it is not a failure. The service role methods are only
/// called for templates that declare a [`ServiceRole`].
pub trait TemplateRenderer: fmt::Debug + Send + Sync {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Option<PolicyDocument>, RenderError>;

    fn render_service_role(&self, ctx: &RenderContext<'_>) -> Result<PolicyDocument, RenderError>;

    fn render_service_assume_role(
        &self,
        ctx: &RenderContext<'_>,
    ) -> Result<PolicyDocument, RenderError>;
}

/// A named, parameterized policy template
#[derive(Debug, Clone)]
pub struct PolicyTemplate {
    key: String,
    vars: Vec<String>,
    scope: Vec<String>,
    service_role: Option<ServiceRole>,
    renderer: Arc<dyn TemplateRenderer>,
    binding: Option<TemplateBinding>,
}

impl PolicyTemplate {
    /// Create an unbound template with no required variables and empty scope
    pub fn new(key: impl Into<String>, renderer: impl TemplateRenderer + 'static) -> Self {
        Self {
            key: key.into(),
            vars: Vec::new(),
            scope: Vec::new(),
            service_role: None,
            renderer: Arc::new(renderer),
            binding: None,
        }
    }

    /// Variable names every attachment must supply, checked in this order
    #[must_use]
    pub fn with_vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vars = vars.into_iter().map(Into::into).collect();
        self
    }

    /// Service identifiers (e.g. `s3:*`) this template may grant
    #[must_use]
    pub fn with_scope<I, S>(mut self, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = scope.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_service_role(mut self, service_role: ServiceRole) -> Self {
        self.service_role = Some(service_role);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn vars(&self) -> &[String] {
        &self.vars
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    pub fn service_role(&self) -> Option<&ServiceRole> {
        self.service_role.as_ref()
    }

    /// The registry and container that own this template, once registered
    pub fn binding(&self) -> Option<&TemplateBinding> {
        self.binding.as_ref()
    }

    pub(crate) fn bind(&mut self, binding: TemplateBinding) {
        self.binding = Some(binding);
    }

    pub(crate) fn render_context<'a>(
        &'a self,
        container: &'a str,
        account: &'a Account,
        vars: &'a BTreeMap<String, String>,
    ) -> RenderContext<'a> {
        RenderContext {
            template: &self.key,
            container,
            account,
            vars,
            service_role: self.service_role.as_ref(),
        }
    }

    pub(crate) fn renderer(&self) -> &dyn TemplateRenderer {
        self.renderer.as_ref()
    }
}
