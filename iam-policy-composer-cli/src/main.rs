//! IAM Policy Composer CLI
//!
//! Loads a manifest of accounts, policy templates, and containers, composes
//! the default-deny policy bundle of each container, and prints it as JSON.

mod manifest;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use iam_policy_composer::{Container, Policy};
use log::debug;
use serde::Serialize;

use crate::manifest::Manifest;

/// Exit code when `--fail-on-missing` is set and a template rendered nothing
const EXIT_MISSING: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "iam-policy-composer",
    version,
    about = "Compose default-deny IAM policy bundles from policy templates"
)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compose policy bundles and print them as JSON
    Compose {
        /// Path to the manifest file
        #[arg(short, long, env = "IAM_POLICY_COMPOSER_MANIFEST")]
        manifest: PathBuf,

        /// Only compose this container
        #[arg(short, long)]
        container: Option<String>,

        /// Print compact JSON instead of pretty-printed JSON
        #[arg(long)]
        compact: bool,

        /// Exit with status 2 if any template rendered no document
        #[arg(long)]
        fail_on_missing: bool,
    },
    /// List the registered policy templates and their owners
    Templates {
        /// Path to the manifest file
        #[arg(short, long, env = "IAM_POLICY_COMPOSER_MANIFEST")]
        manifest: PathBuf,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct MissingAttachment {
    template: String,
    account: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerOutput {
    policy: Policy,
    missing: Vec<MissingAttachment>,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .init();
}

fn compose(container: &Container) -> Result<ContainerOutput> {
    let composed = container
        .policy()
        .with_context(|| format!("Failed to compose policy for container '{}'", container.id()))?;

    let missing = composed
        .missing
        .iter()
        .map(|attachment| {
            debug!(
                "Container '{}': recording missing policy template '{}' for account '{}'",
                container.id(),
                attachment,
                attachment.account().name()
            );
            MissingAttachment {
                template: attachment.to_string(),
                account: attachment.account().name().to_string(),
            }
        })
        .collect();

    Ok(ContainerOutput {
        policy: composed.policy,
        missing,
    })
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Compose {
            manifest,
            container,
            compact,
            fail_on_missing,
        } => {
            let workspace = Manifest::load(&manifest)?.build()?;

            let selected: Vec<&Container> = match container.as_deref() {
                Some(id) => vec![workspace
                    .container(id)
                    .with_context(|| format!("Container '{id}' is not declared in the manifest"))?],
                None => workspace.containers.iter().collect(),
            };

            let mut output = BTreeMap::new();
            for container in selected {
                debug!("Composing container '{}'", container.id());
                output.insert(container.id().to_string(), compose(container)?);
            }

            let any_missing = output.values().any(|o| !o.missing.is_empty());

            let json = if compact {
                serde_json::to_string(&output)?
            } else {
                serde_json::to_string_pretty(&output)?
            };
            println!("{json}");

            if fail_on_missing && any_missing {
                return Ok(ExitCode::from(EXIT_MISSING));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Templates { manifest } => {
            let workspace = Manifest::load(&manifest)?.build()?;
            for key in workspace.registry.template_keys() {
                let Some(template) = workspace.registry.template(&key) else {
                    continue;
                };
                let owner = template.binding().map_or("-", |b| b.container.as_str());
                println!("{key}\t{owner}\t{}", template.scope().join(","));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
