//! Manifest loading: accounts, templates, and containers described in JSON

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use iam_policy_composer::{
    Account, ComposerConfig, CompressionLimits, Container, DocumentTemplate, PolicyTemplate,
    Registry, ServiceRole,
};
use log::info;
use serde::Deserialize;
use serde_json::Value;

/// Top-level manifest document
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Manifest {
    #[serde(default)]
    pub limits: CompressionLimits,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TemplateSpec {
    pub key: String,
    /// Container that registers and owns the template
    pub container: String,
    #[serde(default)]
    pub vars: Vec<String>,
    #[serde(default)]
    pub scope: Vec<String>,
    /// Policy body with `${Name}` placeholders; absent renders nothing
    #[serde(default)]
    pub document: Option<Value>,
    #[serde(default)]
    pub service_role: Option<ServiceRoleSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServiceRoleSpec {
    pub name: String,
    pub service: String,
    pub document: Value,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ContainerSpec {
    pub id: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AttachmentSpec {
    pub template: String,
    pub account: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Registry and containers built from a manifest
pub(crate) struct Workspace {
    pub registry: Arc<Registry>,
    pub containers: Vec<Container>,
}

impl Workspace {
    pub fn container(&self, id: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.id() == id)
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    /// Register accounts and templates, then replay every attachment
    pub fn build(self) -> Result<Workspace> {
        let registry = Registry::with_config(ComposerConfig {
            limits: self.limits,
        });

        let mut seen = Vec::new();
        for spec in &self.containers {
            if seen.contains(&spec.id.as_str()) {
                bail!("container '{}' is declared more than once", spec.id);
            }
            seen.push(spec.id.as_str());
        }

        for account in self.accounts {
            registry.add_account(account)?;
        }

        let mut containers: Vec<Container> = Vec::new();
        let ids = self
            .containers
            .iter()
            .map(|c| c.id.as_str())
            .chain(self.templates.iter().map(|t| t.container.as_str()));
        for id in ids {
            if containers.iter().any(|c| c.id() == id) {
                continue;
            }
            containers.push(Container::new(id, Arc::clone(&registry)));
        }

        for spec in self.templates {
            let owner = find_container(&containers, &spec.container)?;
            let key = spec.key.clone();
            owner
                .add_policy_template(spec.into_template())
                .with_context(|| format!("Failed to register policy template '{key}'"))?;
        }

        for spec in &self.containers {
            let container = find_container(&containers, &spec.id)?;
            for attachment in &spec.attachments {
                container.add_attachment(
                    &attachment.template,
                    &attachment.account,
                    attachment.vars.clone(),
                )?;
            }
        }

        info!(
            "Loaded manifest: {} accounts, {} templates, {} containers",
            registry.account_count(),
            registry.template_count(),
            containers.len()
        );

        Ok(Workspace {
            registry,
            containers,
        })
    }
}

fn find_container<'a>(containers: &'a [Container], id: &str) -> Result<&'a Container> {
    containers
        .iter()
        .find(|c| c.id() == id)
        .with_context(|| format!("unknown container '{id}'"))
}

impl TemplateSpec {
    fn into_template(self) -> PolicyTemplate {
        let mut renderer = self
            .document
            .map_or_else(DocumentTemplate::absent, DocumentTemplate::new);

        let mut template_role = None;
        if let Some(role) = self.service_role {
            renderer = renderer.with_service_role_body(role.document);
            template_role = Some(ServiceRole::new(role.name, role.service));
        }

        let template = PolicyTemplate::new(self.key, renderer)
            .with_vars(self.vars)
            .with_scope(self.scope);

        match template_role {
            Some(role) => template.with_service_role(role),
            None => template,
        }
    }
}
