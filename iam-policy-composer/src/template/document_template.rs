//! JSON document templates with `${Name}` placeholders
//!
//! Placeholders are resolved from the attachment variables first, then from
//! the built-ins `Account`, `AccountId`, and `Container`. Substitution happens
//! inside JSON string values only, so variable values can never change the
//! document structure.

use std::sync::OnceLock;

use log::trace;
use regex::Regex;
use serde_json::{json, Value};

use super::{RenderContext, RenderError, TemplateRenderer};
use crate::document::{Effect, PolicyDocument, Statement};

const ASSUME_ROLE_ACTION: &str = "sts:AssumeRole";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("placeholder pattern is a valid regex")
    })
}

/// Renderer backed by an in-memory JSON policy body
///
/// A template without a body renders to "absent", which the composer reports
/// as a missing attachment rather than a failure.
#[derive(Debug, Clone, Default)]
pub struct DocumentTemplate {
    body: Option<Value>,
    service_role_body: Option<Value>,
}

impl DocumentTemplate {
    pub fn new(body: Value) -> Self {
        Self {
            body: Some(body),
            service_role_body: None,
        }
    }

    /// A template that intentionally renders nothing
    pub fn absent() -> Self {
        Self::default()
    }

    /// Policy attached to the template's service role
    #[must_use]
    pub fn with_service_role_body(mut self, body: Value) -> Self {
        self.service_role_body = Some(body);
        self
    }

    fn render_body(&self, body: &Value, ctx: &RenderContext<'_>) -> Result<PolicyDocument, RenderError> {
        let rendered = substitute_value(body, ctx)?;
        trace!("Rendered policy template '{}': {}", ctx.template, rendered);
        serde_json::from_value(rendered).map_err(|source| RenderError::InvalidDocument {
            template: ctx.template.to_string(),
            source,
        })
    }
}

impl TemplateRenderer for DocumentTemplate {
    fn render(&self, ctx: &RenderContext<'_>) -> Result<Option<PolicyDocument>, RenderError> {
        self.body
            .as_ref()
            .map(|body| self.render_body(body, ctx))
            .transpose()
    }

    fn render_service_role(
        &self,
        ctx: &RenderContext<'_>,
    ) -> Result<PolicyDocument, RenderError> {
        let role = ctx.service_role.ok_or_else(|| RenderError::NoServiceRole {
            template: ctx.template.to_string(),
        })?;
        let body = self
            .service_role_body
            .as_ref()
            .ok_or_else(|| RenderError::MissingServiceRoleBody {
                template: ctx.template.to_string(),
                role: role.name.clone(),
            })?;
        self.render_body(body, ctx)
    }

    fn render_service_assume_role(
        &self,
        ctx: &RenderContext<'_>,
    ) -> Result<PolicyDocument, RenderError> {
        let role = ctx.service_role.ok_or_else(|| RenderError::NoServiceRole {
            template: ctx.template.to_string(),
        })?;

        let mut trust = Statement::new(
            Effect::Allow,
            vec![ASSUME_ROLE_ACTION.to_string()],
            Vec::new(),
        );
        trust.principal = Some(json!({ "Service": role.service }));

        Ok(PolicyDocument::single(trust))
    }
}

fn resolve<'a>(name: &str, ctx: &RenderContext<'a>) -> Option<&'a str> {
    if let Some(value) = ctx.vars.get(name) {
        return Some(value.as_str());
    }
    match name {
        "Account" => Some(ctx.account.name()),
        "AccountId" => ctx.account.id(),
        "Container" => Some(ctx.container),
        _ => None,
    }
}

fn substitute(input: &str, ctx: &RenderContext<'_>) -> Result<String, RenderError> {
    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for caps in placeholder_pattern().captures_iter(input) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = resolve(name.as_str(), ctx).ok_or_else(|| RenderError::UnresolvedPlaceholder {
            template: ctx.template.to_string(),
            name: name.as_str().to_string(),
        })?;
        output.push_str(&input[last..whole.start()]);
        output.push_str(value);
        last = whole.end();
    }

    output.push_str(&input[last..]);
    Ok(output)
}

fn substitute_value(value: &Value, ctx: &RenderContext<'_>) -> Result<Value, RenderError> {
    Ok(match value {
        Value::String(s) => Value::String(substitute(s, ctx)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, ctx))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), substitute_value(v, ctx)?)))
                .collect::<Result<_, RenderError>>()?,
        ),
        other => other.clone(),
    })
}
