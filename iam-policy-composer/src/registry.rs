//! Process-wide registry of policy templates and accounts
//!
//! The registry owns global naming. All of its state sits behind a single
//! reader-writer lock: registration takes it exclusively, while attachment and
//! composition on any container take it shared. Containers always acquire the
//! registry lock before their own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Deserialize;
use uuid::Uuid;

use crate::config::ComposerConfig;
use crate::error::{ComposerError, ComposerResult};
use crate::template::{PolicyTemplate, TemplateBinding};

/// Identity of a registry, recorded in the bindings of its templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistryId(Uuid);

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A target account for attachments
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Account {
    name: String,
    #[serde(default)]
    id: Option<String>,
}

impl Account {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    /// An account with its numeric cloud account id, available to templates
    /// as `${AccountId}`
    pub fn with_id(name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: Some(id.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }
}

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) templates: HashMap<String, Arc<PolicyTemplate>>,
    pub(crate) accounts: HashMap<String, Arc<Account>>,
}

/// Registry of templates and accounts shared by all containers
#[derive(Debug)]
pub struct Registry {
    id: RegistryId,
    config: ComposerConfig,
    state: RwLock<RegistryState>,
}

impl Registry {
    /// Create an empty registry with default limits
    pub fn new() -> Arc<Self> {
        Self::with_config(ComposerConfig::default())
    }

    pub fn with_config(config: ComposerConfig) -> Arc<Self> {
        Arc::new(Self {
            id: RegistryId(Uuid::new_v4()),
            config,
            state: RwLock::new(RegistryState::default()),
        })
    }

    pub fn id(&self) -> RegistryId {
        self.id
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    /// Register an account so attachments may reference it by name
    pub fn add_account(&self, account: Account) -> ComposerResult<()> {
        let mut state = self.state.write();

        if state.accounts.contains_key(account.name()) {
            return Err(ComposerError::DuplicateAccount {
                name: account.name().to_string(),
            });
        }

        debug!("Registered account '{}'", account.name());
        state
            .accounts
            .insert(account.name().to_string(), Arc::new(account));

        Ok(())
    }

    /// Bind `template` to this registry and `container`, then insert it.
    ///
    /// Only the registry lock is taken; registration excludes every attachment
    /// and composition in flight on any container.
    pub(crate) fn add_policy_template(
        &self,
        mut template: PolicyTemplate,
        container: &str,
    ) -> ComposerResult<()> {
        let mut state = self.state.write();

        if state.templates.contains_key(template.key()) {
            return Err(ComposerError::DuplicateTemplate {
                key: template.key().to_string(),
            });
        }

        if template.binding().is_some() {
            return Err(ComposerError::InvalidTemplateState {
                key: template.key().to_string(),
            });
        }

        template.bind(TemplateBinding {
            registry: self.id,
            container: container.to_string(),
        });

        debug!(
            "Registered policy template '{}' in container '{}'",
            template.key(),
            container
        );
        state
            .templates
            .insert(template.key().to_string(), Arc::new(template));

        Ok(())
    }

    pub fn template(&self, key: &str) -> Option<Arc<PolicyTemplate>> {
        self.state.read().templates.get(key).cloned()
    }

    pub fn account(&self, name: &str) -> Option<Arc<Account>> {
        self.state.read().accounts.get(name).cloned()
    }

    pub fn template_count(&self) -> usize {
        self.state.read().templates.len()
    }

    pub fn account_count(&self) -> usize {
        self.state.read().accounts.len()
    }

    /// Registered template keys, sorted
    pub fn template_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.read().templates.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Shared access for containers. Must be taken before any container lock.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read()
    }
}
