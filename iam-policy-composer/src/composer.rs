//! Policy composition
//!
//! Merges every attachment of a container into one default-deny bundle per
//! account:
//! - each rendered template document, in attachment order
//! - a synthesized deny: `DenyAll` when the account's templates grant no
//!   scope, otherwise `DenyUnknownServices` with the sorted scope as `NotAction`
//! - `AllowAll`, only when the scope is non-empty
//!
//! Account role policies are the same list without the trailing `AllowAll`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::container::{Attachment, Container};
use crate::document::{PolicyDocument, Statement, IAM_POLICY_VERSION};
use crate::error::{ComposerError, ComposerResult};

/// Policy and trust policy for one service role
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceRolePolicy {
    pub policy: PolicyDocument,
    pub assume_role_policy: PolicyDocument,
}

/// Composed policy bundle, keyed by account name
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Policy {
    /// Rendered documents, the synthesized deny, and `AllowAll` when scoped
    pub account_policies: BTreeMap<String, Vec<PolicyDocument>>,
    /// Rendered documents and the synthesized deny
    pub account_role_policies: BTreeMap<String, Vec<PolicyDocument>>,
    /// Account name → role name → role documents
    pub service_role_policies: BTreeMap<String, BTreeMap<String, ServiceRolePolicy>>,
}

impl Policy {
    pub fn to_json_pretty(&self) -> ComposerResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Successful composition: the bundle plus attachments whose template
/// rendered no document
#[derive(Debug)]
pub struct ComposedPolicy {
    pub policy: Policy,
    pub missing: Vec<Arc<Attachment>>,
}

impl ComposedPolicy {
    pub fn has_missing(&self) -> bool {
        !self.missing.is_empty()
    }
}

impl Container {
    /// Compose the policy bundle for every account this container touches.
    ///
    /// Holds the registry and container locks shared while rendering, so
    /// compositions on any number of containers run concurrently. The first
    /// render or version error aborts with no partial result, as does a
    /// compression error.
    pub fn policy(&self) -> ComposerResult<ComposedPolicy> {
        let locked = self.lock_shared();
        let limits = &self.registry().config().limits;

        let mut account_policies: BTreeMap<String, Vec<PolicyDocument>> = BTreeMap::new();
        let mut account_role_policies: BTreeMap<String, Vec<PolicyDocument>> = BTreeMap::new();
        let mut service_role_policies: BTreeMap<String, BTreeMap<String, ServiceRolePolicy>> =
            BTreeMap::new();
        let mut scopes: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut missing = Vec::new();

        for attachment in locked.attachments.iter() {
            let template = attachment.template();
            let account = attachment.account().name();

            service_role_policies.entry(account.to_string()).or_default();

            let ctx = template.render_context(self.id(), attachment.account(), attachment.vars());
            let rendered = template.renderer().render(&ctx)?;

            let scope = scopes.entry(account.to_string()).or_default();

            let Some(document) = rendered else {
                warn!(
                    "Policy template '{}' rendered no document for account '{}' in container '{}'",
                    template.key(),
                    account,
                    self.id()
                );
                account_policies
                    .entry(account.to_string())
                    .or_default()
                    .push(PolicyDocument::default());
                missing.push(Arc::clone(attachment));
                continue;
            };

            if !document.version.is_empty() && document.version != IAM_POLICY_VERSION {
                return Err(ComposerError::UnsupportedVersion {
                    version: document.version,
                });
            }

            account_policies
                .entry(account.to_string())
                .or_default()
                .push(document);

            scope.extend(template.scope().iter().cloned());

            if let Some(role) = template.service_role() {
                let role_policy = ServiceRolePolicy {
                    policy: template.renderer().render_service_role(&ctx)?,
                    assume_role_policy: template.renderer().render_service_assume_role(&ctx)?,
                };

                // Last attachment for an account/role pair wins.
                if service_role_policies
                    .entry(account.to_string())
                    .or_default()
                    .insert(role.name.clone(), role_policy)
                    .is_some()
                {
                    debug!(
                        "Service role '{}' for account '{}' replaced by policy template '{}'",
                        role.name,
                        account,
                        template.key()
                    );
                }
            }
        }

        drop(locked);

        for (account, scope) in scopes {
            let policies = account_policies.entry(account.clone()).or_default();

            let deny = if scope.is_empty() {
                Statement::deny_all()
            } else {
                let mut not_action: Vec<String> = scope.iter().cloned().collect();
                not_action.sort();
                Statement::deny_unless_in_scope(not_action)
            };

            debug!(
                "Account '{}': {} scope entries, {} documents before synthesis",
                account,
                scope.len(),
                policies.len()
            );

            policies.push(PolicyDocument::single(deny));
            account_role_policies.insert(account, policies.clone());

            if !scope.is_empty() {
                policies.push(PolicyDocument::single(Statement::allow_all()));
            }
        }

        let mut policy = Policy {
            account_policies,
            account_role_policies,
            service_role_policies,
        };

        policy.compress(limits)?;

        Ok(ComposedPolicy { policy, missing })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::compression::{CompressionError, CompressionLimits};
    use crate::config::ComposerConfig;
    use crate::document::{Effect, WILDCARD};
    use crate::registry::{Account, Registry};
    use crate::template::{
        DocumentTemplate, PolicyTemplate, RenderContext, RenderError, ServiceRole,
        TemplateRenderer,
    };

    fn allow_doc(action: &str, resource: &str) -> serde_json::Value {
        json!({
            "Version": "2012-10-17",
            "Statement": [{ "Effect": "Allow", "Action": action, "Resource": resource }]
        })
    }

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn create_test_container(accounts: &[&str]) -> Container {
        let registry = Registry::new();
        for account in accounts {
            registry.add_account(Account::new(*account)).unwrap();
        }
        Container::new("web", registry)
    }

    /// Renderer that fails every call, counting how often it was asked
    #[derive(Debug, Default)]
    struct FailingRenderer {
        calls: Arc<AtomicUsize>,
    }

    impl TemplateRenderer for FailingRenderer {
        fn render(&self, ctx: &RenderContext<'_>) -> Result<Option<PolicyDocument>, RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(RenderError::Failed {
                template: ctx.template.to_string(),
                message: "backend unavailable".to_string(),
            })
        }

        fn render_service_role(
            &self,
            ctx: &RenderContext<'_>,
        ) -> Result<PolicyDocument, RenderError> {
            self.render(ctx).map(Option::unwrap_or_default)
        }

        fn render_service_assume_role(
            &self,
            ctx: &RenderContext<'_>,
        ) -> Result<PolicyDocument, RenderError> {
            self.render(ctx).map(Option::unwrap_or_default)
        }
    }

    #[test]
    fn test_policy_scoped_account() {
        let container = create_test_container(&["A"]);
        container
            .add_policy_template(
                PolicyTemplate::new(
                    "T1",
                    DocumentTemplate::new(allow_doc("s3:GetObject", "arn:aws:s3:::data/*")),
                )
                .with_scope(["s3:*"]),
            )
            .unwrap();
        container
            .add_policy_template(
                PolicyTemplate::new(
                    "T2",
                    DocumentTemplate::new(allow_doc("ec2:DescribeInstances", "${Bucket}")),
                )
                .with_vars(["Bucket"])
                .with_scope(["ec2:*"]),
            )
            .unwrap();
        container.add_attachment("T1", "A", BTreeMap::new()).unwrap();
        container
            .add_attachment("T2", "A", vars(&[("Bucket", "x")]))
            .unwrap();

        let composed = container.policy().unwrap();
        assert!(!composed.has_missing());

        let role_policies = &composed.policy.account_role_policies["A"];
        assert_eq!(role_policies.len(), 3);
        assert_eq!(role_policies[0].statement[0].action, vec!["s3:GetObject"]);
        assert_eq!(role_policies[1].statement[0].resource, vec!["x"]);
        assert_eq!(
            role_policies[2].statement[0],
            Statement::deny_unless_in_scope(vec!["ec2:*".to_string(), "s3:*".to_string()])
        );

        let policies = &composed.policy.account_policies["A"];
        assert_eq!(policies.len(), 4);
        assert_eq!(&policies[..3], &role_policies[..]);
        assert_eq!(policies[3].statement[0], Statement::allow_all());
    }

    #[test]
    fn test_policy_unscoped_account_denies_everything() {
        let container = create_test_container(&["A"]);
        container
            .add_policy_template(PolicyTemplate::new(
                "readonly",
                DocumentTemplate::new(allow_doc("iam:Get*", "*")),
            ))
            .unwrap();
        container
            .add_attachment("readonly", "A", BTreeMap::new())
            .unwrap();

        let composed = container.policy().unwrap();
        let policies = &composed.policy.account_policies["A"];

        assert_eq!(policies.len(), 2);
        assert_eq!(policies[1].statement[0], Statement::deny_all());
        assert!(policies
            .iter()
            .flat_map(|doc| &doc.statement)
            .all(|s| s.effect != Effect::Allow || s.action != vec![WILDCARD]));
        assert_eq!(composed.policy.account_role_policies["A"], *policies);
    }

    #[test]
    fn test_policy_missing_render() {
        let container = create_test_container(&["B"]);
        container
            .add_policy_template(
                PolicyTemplate::new("ghost", DocumentTemplate::absent()).with_scope(["sqs:*"]),
            )
            .unwrap();
        let attachment = container
            .add_attachment("ghost", "B", BTreeMap::new())
            .unwrap();

        let composed = container.policy().unwrap();

        assert_eq!(composed.missing.len(), 1);
        assert!(Arc::ptr_eq(&composed.missing[0], &attachment));

        let policies = &composed.policy.account_policies["B"];
        assert_eq!(policies.len(), 2);
        assert!(policies[0].is_placeholder());
        assert_eq!(policies[1].statement[0], Statement::deny_all());
        assert!(composed.policy.service_role_policies["B"].is_empty());
    }

    #[test]
    fn test_policy_unsupported_version() {
        let container = create_test_container(&["A"]);
        container
            .add_policy_template(PolicyTemplate::new(
                "legacy",
                DocumentTemplate::new(json!({
                    "Version": "2008-10-17",
                    "Statement": [{ "Effect": "Allow", "Action": "s3:*", "Resource": "*" }]
                })),
            ))
            .unwrap();
        container
            .add_attachment("legacy", "A", BTreeMap::new())
            .unwrap();

        let err = container.policy().unwrap_err();
        assert!(
            matches!(err, ComposerError::UnsupportedVersion { ref version } if version == "2008-10-17"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_policy_render_failure_aborts_on_first_error() {
        let container = create_test_container(&["A"]);
        let calls = Arc::new(AtomicUsize::new(0));
        container
            .add_policy_template(PolicyTemplate::new(
                "broken",
                FailingRenderer {
                    calls: Arc::clone(&calls),
                },
            ))
            .unwrap();
        container.add_attachment("broken", "A", BTreeMap::new()).unwrap();
        container.add_attachment("broken", "A", BTreeMap::new()).unwrap();

        let err = container.policy().unwrap_err();
        assert!(matches!(err, ComposerError::Render(RenderError::Failed { .. })));
        assert_eq!(
            err.to_string(),
            "policy template 'broken' failed to render: backend unavailable"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_policy_empty_container() {
        let container = create_test_container(&["A"]);
        let composed = container.policy().unwrap();
        assert_eq!(composed.policy, Policy::default());
        assert!(composed.missing.is_empty());
    }

    #[test]
    fn test_policy_service_roles_last_write_wins() {
        let container = create_test_container(&["A"]);
        let role = ServiceRole::new("worker", "lambda.amazonaws.com");
        for (key, log_group) in [("first", "one"), ("second", "two")] {
            container
                .add_policy_template(
                    PolicyTemplate::new(
                        key,
                        DocumentTemplate::new(allow_doc("lambda:InvokeFunction", "*"))
                            .with_service_role_body(allow_doc("logs:PutLogEvents", log_group)),
                    )
                    .with_scope(["lambda:*"])
                    .with_service_role(role.clone()),
                )
                .unwrap();
            container.add_attachment(key, "A", BTreeMap::new()).unwrap();
        }

        let composed = container.policy().unwrap();
        let roles = &composed.policy.service_role_policies["A"];

        assert_eq!(roles.len(), 1);
        assert_eq!(roles["worker"].policy.statement[0].resource, vec!["two"]);
        assert_eq!(
            roles["worker"].assume_role_policy.statement[0].action,
            vec!["sts:AssumeRole"]
        );
        // Service role documents never reach the account lists.
        assert_eq!(composed.policy.account_policies["A"].len(), 4);
    }

    #[test]
    fn test_policy_service_role_failure_aborts() {
        let container = create_test_container(&["A"]);
        container
            .add_policy_template(
                PolicyTemplate::new(
                    "no-role-body",
                    DocumentTemplate::new(allow_doc("lambda:InvokeFunction", "*")),
                )
                .with_service_role(ServiceRole::new("worker", "lambda.amazonaws.com")),
            )
            .unwrap();
        container
            .add_attachment("no-role-body", "A", BTreeMap::new())
            .unwrap();

        let err = container.policy().unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Render(RenderError::MissingServiceRoleBody { .. })
        ));
    }

    #[test]
    fn test_policy_accounts_are_independent() {
        let container = create_test_container(&["A", "B"]);
        container
            .add_policy_template(
                PolicyTemplate::new("s3", DocumentTemplate::new(allow_doc("s3:GetObject", "*")))
                    .with_scope(["s3:*"]),
            )
            .unwrap();
        container
            .add_policy_template(PolicyTemplate::new(
                "plain",
                DocumentTemplate::new(allow_doc("sts:GetCallerIdentity", "*")),
            ))
            .unwrap();
        container.add_attachment("s3", "A", BTreeMap::new()).unwrap();
        container.add_attachment("plain", "B", BTreeMap::new()).unwrap();

        let composed = container.policy().unwrap();

        let a = &composed.policy.account_policies["A"];
        assert_eq!(a.last().unwrap().statement[0], Statement::allow_all());
        let b = &composed.policy.account_policies["B"];
        assert_eq!(b.last().unwrap().statement[0], Statement::deny_all());
    }

    #[test]
    fn test_policy_serializes_deterministically() {
        let container = create_test_container(&["A"]);
        container
            .add_policy_template(
                PolicyTemplate::new("multi", DocumentTemplate::new(allow_doc("s3:GetObject", "*")))
                    .with_scope(["sqs:*", "s3:*", "dynamodb:*", "ec2:*"]),
            )
            .unwrap();
        container.add_attachment("multi", "A", BTreeMap::new()).unwrap();

        let first = container.policy().unwrap().policy.to_json_pretty().unwrap();
        for _ in 0..10 {
            assert_eq!(container.policy().unwrap().policy.to_json_pretty().unwrap(), first);
        }
        assert!(first.contains(r#""NotAction": ["#));
    }

    #[test]
    fn test_policy_compression_failure_surfaces_as_error() {
        let registry = Registry::with_config(ComposerConfig {
            limits: CompressionLimits {
                max_documents_per_account: 1,
                ..CompressionLimits::default()
            },
        });
        registry.add_account(Account::new("A")).unwrap();
        let container = Container::new("web", registry);
        container
            .add_policy_template(
                PolicyTemplate::new("s3", DocumentTemplate::new(allow_doc("s3:GetObject", "*")))
                    .with_scope(["s3:*"]),
            )
            .unwrap();
        container.add_attachment("s3", "A", BTreeMap::new()).unwrap();

        let err = container.policy().unwrap_err();
        assert!(
            matches!(
                err,
                ComposerError::Compression(CompressionError::TooManyDocuments {
                    count: 3,
                    limit: 1,
                    ..
                })
            ),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_policy_keeps_not_principal_and_not_resource() {
        let container = create_test_container(&["A"]);
        container
            .add_policy_template(
                PolicyTemplate::new(
                    "guarded",
                    DocumentTemplate::new(json!({
                        "Version": "2012-10-17",
                        "Statement": [
                            {
                                "Effect": "Deny",
                                "NotPrincipal": { "AWS": "arn:aws:iam::111122223333:role/admin" },
                                "Action": "s3:DeleteBucket",
                                "Resource": "*"
                            },
                            {
                                "Effect": "Allow",
                                "Action": "s3:*",
                                "NotResource": "arn:aws:s3:::audit/*"
                            }
                        ]
                    })),
                )
                .with_scope(["s3:*"]),
            )
            .unwrap();
        container.add_attachment("guarded", "A", BTreeMap::new()).unwrap();

        let composed = container.policy().unwrap();
        let json = serde_json::to_value(&composed.policy).unwrap();
        let statements = &json["AccountPolicies"]["A"][0]["Statement"];

        assert_eq!(
            statements[0]["NotPrincipal"],
            json!({ "AWS": "arn:aws:iam::111122223333:role/admin" })
        );
        assert_eq!(statements[1]["NotResource"], json!(["arn:aws:s3:::audit/*"]));
        assert!(statements[1].get("Resource").is_none());
    }

    #[test]
    fn test_policy_rejects_unknown_statement_keys() {
        let container = create_test_container(&["A"]);
        container
            .add_policy_template(PolicyTemplate::new(
                "typo",
                DocumentTemplate::new(json!({
                    "Version": "2012-10-17",
                    "Statement": [{ "Effect": "Allow", "Action": "s3:*", "Resource": "*", "Conditon": {} }]
                })),
            ))
            .unwrap();
        container.add_attachment("typo", "A", BTreeMap::new()).unwrap();

        let err = container.policy().unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Render(RenderError::InvalidDocument { .. })
        ));
    }
}
