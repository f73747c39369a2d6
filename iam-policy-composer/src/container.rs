//! Containers and their attachments
//!
//! A container is the unit of composition: it accumulates attachments
//! (template + account + variables) and later merges them into one policy
//! bundle per account. Each container has its own lock, always acquired after
//! the registry lock through [`Container::lock_shared`] or
//! [`Container::lock_exclusive`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{ComposerError, ComposerResult};
use crate::registry::{Account, Registry, RegistryState};
use crate::template::PolicyTemplate;

/// One template bound to one account with concrete variable values
#[derive(Debug)]
pub struct Attachment {
    template: Arc<PolicyTemplate>,
    account: Arc<Account>,
    vars: BTreeMap<String, String>,
}

impl Attachment {
    pub fn template(&self) -> &PolicyTemplate {
        &self.template
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}

impl fmt::Display for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template.key())
    }
}

/// Registry and container guards held together.
///
/// Fields drop in declaration order, so the container guard is released
/// before the registry guard.
pub(crate) struct Locked<'a, G> {
    pub(crate) attachments: G,
    pub(crate) registry: RwLockReadGuard<'a, RegistryState>,
}

/// Accumulator of attachments for one deployable unit
#[derive(Debug)]
pub struct Container {
    id: String,
    registry: Arc<Registry>,
    attachments: RwLock<Vec<Arc<Attachment>>>,
}

impl Container {
    pub fn new(id: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self {
            id: id.into(),
            registry,
            attachments: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Register `template` in the shared registry, owned by this container.
    ///
    /// Fails if the key is already taken or the template is already bound to
    /// a registry.
    pub fn add_policy_template(&self, template: PolicyTemplate) -> ComposerResult<()> {
        self.registry.add_policy_template(template, &self.id)
    }

    /// Attach a registered template to a registered account.
    ///
    /// Every variable the template requires must be present in `vars`; extra
    /// variables are kept. On error the attachment list is unchanged.
    pub fn add_attachment(
        &self,
        template_key: &str,
        account_name: &str,
        vars: BTreeMap<String, String>,
    ) -> ComposerResult<Arc<Attachment>> {
        let mut locked = self.lock_exclusive();

        let template = locked
            .registry
            .templates
            .get(template_key)
            .cloned()
            .ok_or_else(|| ComposerError::unknown_template(template_key, &self.id))?;

        let account = locked
            .registry
            .accounts
            .get(account_name)
            .cloned()
            .ok_or_else(|| ComposerError::unknown_account(account_name, &self.id))?;

        if let Some(missing) = template.vars().iter().find(|name| !vars.contains_key(*name)) {
            return Err(ComposerError::missing_variable(missing, template.key(), &self.id));
        }

        let attachment = Arc::new(Attachment {
            template,
            account,
            vars,
        });

        debug!(
            "Attached policy template '{}' to account '{}' in container '{}'",
            template_key, account_name, self.id
        );
        locked.attachments.push(Arc::clone(&attachment));

        Ok(attachment)
    }

    /// Snapshot of the attachments in insertion order
    pub fn attachments(&self) -> Vec<Arc<Attachment>> {
        self.lock_shared().attachments.clone()
    }

    pub fn len(&self) -> usize {
        self.lock_shared().attachments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registry shared, then container shared
    pub(crate) fn lock_shared(&self) -> Locked<'_, RwLockReadGuard<'_, Vec<Arc<Attachment>>>> {
        let registry = self.registry.read();
        let attachments = self.attachments.read();
        Locked {
            attachments,
            registry,
        }
    }

    /// Registry shared, then container exclusive
    fn lock_exclusive(&self) -> Locked<'_, RwLockWriteGuard<'_, Vec<Arc<Attachment>>>> {
        let registry = self.registry.read();
        let attachments = self.attachments.write();
        Locked {
            attachments,
            registry,
        }
    }
}
