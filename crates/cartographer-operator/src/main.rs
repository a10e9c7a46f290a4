//! Cartographer Operator Service
//!
//! Kubernetes operator that manages ML workspaces.
//! Watches Workspace CRDs and reconciles their database, experiment tracking,
//! workflow and compute children. Also serves the Workspace admission webhooks.

mod admission;
mod crd;
mod defaults;
mod error;
mod naming;
mod reconciler;
mod store;
mod validation;
mod webhook;

use crate::crd::Workspace;
use crate::defaults::{DefaultImages, Defaulter};
use crate::reconciler::{Context, ReconcileOptions, RequeueSettings, WorkspaceReconciler};
use crate::store::KubeStore;
use crate::webhook::WebhookState;
use cartographer_common::{telemetry, tls, Error, TelemetrySettings, WebhookSettings};
use clap::{ArgAction, Args, Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cartographer-operator")]
#[command(about = "Cartographer Kubernetes Operator")]
struct Cli {
    /// Log level or EnvFilter directive
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller and the admission webhook server
    Run(RunArgs),
    /// Print the Workspace CustomResourceDefinition as YAML
    Crd,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Namespace to watch; all namespaces when unset
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Webhook listen address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:9443")]
    webhook_addr: SocketAddr,

    /// PEM certificate for the webhook server
    #[arg(long, env = "WEBHOOK_CERT_PATH")]
    webhook_cert: Option<PathBuf>,

    /// PEM private key for the webhook server
    #[arg(long, env = "WEBHOOK_KEY_PATH")]
    webhook_key: Option<PathBuf>,

    /// Image repository for Ray; tagged with the workspace's ray version
    #[arg(long, env = "COMPUTE_IMAGE", default_value = "rayproject/ray")]
    compute_image: String,

    #[arg(long, env = "EXPERIMENT_TRACKING_IMAGE", default_value = "willemmeints/experiment-tracking:latest")]
    experiment_tracking_image: String,

    #[arg(long, env = "WORKFLOW_CONTROLLER_IMAGE", default_value = "willemmeints/workflow-controller:latest")]
    workflow_controller_image: String,

    #[arg(long, env = "WORKFLOW_AGENT_IMAGE", default_value = "willemmeints/workflow-agent:latest")]
    workflow_agent_image: String,

    /// Delete agent pools that were removed from the workspace spec
    #[arg(long, env = "PRUNE_AGENT_POOLS", default_value_t = true, action = ArgAction::Set)]
    prune_agent_pools: bool,

    /// Seconds between resyncs of a healthy workspace
    #[arg(long, env = "RESYNC_SECS", default_value = "300")]
    resync_secs: u64,

    /// Seconds before retrying after a transient failure
    #[arg(long, env = "TRANSIENT_BACKOFF_SECS", default_value = "5")]
    transient_backoff_secs: u64,

    /// Seconds before retrying after a terminal failure
    #[arg(long, env = "TERMINAL_BACKOFF_SECS", default_value = "300")]
    terminal_backoff_secs: u64,
}

impl RunArgs {
    fn defaulter(&self) -> Defaulter {
        Defaulter::new(DefaultImages {
            compute_base: self.compute_image.clone(),
            experiment_tracking: self.experiment_tracking_image.clone(),
            workflow_controller: self.workflow_controller_image.clone(),
            workflow_agent: self.workflow_agent_image.clone(),
        })
    }

    fn webhook_settings(&self) -> cartographer_common::Result<WebhookSettings> {
        if self.webhook_cert.is_some() != self.webhook_key.is_some() {
            return Err(Error::Config(
                "webhook certificate and key must be configured together".into(),
            ));
        }
        Ok(WebhookSettings {
            bind_addr: self.webhook_addr,
            cert_path: self.webhook_cert.clone(),
            key_path: self.webhook_key.clone(),
        })
    }

    fn requeue(&self) -> RequeueSettings {
        RequeueSettings {
            resync: Duration::from_secs(self.resync_secs),
            transient: Duration::from_secs(self.transient_backoff_secs),
            terminal: Duration::from_secs(self.terminal_backoff_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tls::install_crypto_provider();

    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Command::Crd => {
            print!("{}", serde_yaml::to_string(&Workspace::crd())?);
            Ok(())
        }
        Command::Run(args) => {
            telemetry::init(&TelemetrySettings {
                log_level: cli.log_level,
                json_logs: cli.json_logs,
            })?;
            run(args).await
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    info!("Starting Cartographer Operator");
    info!("Namespace: {}", args.namespace.as_deref().unwrap_or("<all>"));

    let webhook_settings = args.webhook_settings()?;
    let defaulter = args.defaulter();
    info!("Compute image: {}", defaulter.images().compute_base);

    let client = Client::try_default().await?;
    let ctx = Arc::new(Context {
        reconciler: WorkspaceReconciler::new(
            KubeStore::new(client.clone()),
            defaulter.clone(),
            ReconcileOptions {
                prune_agent_pools: args.prune_agent_pools,
            },
        ),
        requeue: args.requeue(),
    });
    let webhook_state = Arc::new(WebhookState { defaulter });

    tokio::select! {
        _ = reconciler::run(client, args.namespace.as_deref(), ctx) => {
            info!("Controller stopped");
        }
        result = webhook::serve(&webhook_settings, webhook_state) => {
            if let Err(e) = &result {
                error!("Webhook server failed: {:#}", e);
            }
            result?;
        }
    }

    info!("Cartographer Operator stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["cartographer-operator", "run"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.namespace.is_none());
        assert!(args.prune_agent_pools);
        assert_eq!(args.webhook_addr.port(), 9443);
        assert_eq!(args.defaulter().images(), &DefaultImages::default());
        assert_eq!(args.requeue().transient, Duration::from_secs(5));
    }

    #[test]
    fn test_pruning_can_be_disabled() {
        let cli = Cli::try_parse_from(["cartographer-operator", "run", "--prune-agent-pools", "false"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(!args.prune_agent_pools);
    }

    #[test]
    fn test_cert_without_key_is_config_error() {
        let cli = Cli::try_parse_from(["cartographer-operator", "run", "--webhook-cert", "/certs/tls.crt"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.webhook_settings().unwrap_err().code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_crd_yaml_names_group() {
        let yaml = serde_yaml::to_string(&Workspace::crd()).unwrap();
        assert!(yaml.contains("workspaces.mlops.aigency.com"));
    }
}
