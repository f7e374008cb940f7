/*
 * 5D Labs Lab Platform - Kubernetes Orchestrator for Per-User Lab Workloads
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! labctl - operator CLI for the lab orchestrator.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use lab_orchestrator::collaborators::{InMemoryCatalog, StaticOverrides};
use lab_orchestrator::orchestrator::ResourceRequest;
use lab_orchestrator::{
    ClusterClient, CreateRequest, DeploymentOrchestrator, InMemoryCluster, KubeCluster,
    OrchestratorConfig, Role, UserIdentity, WorkloadType,
};

/// labctl - Provision and manage per-user lab workloads.
#[derive(Parser)]
#[command(name = "labctl")]
#[command(about = "Provision, pause, resume and delete per-user lab workloads")]
struct Cli {
    /// Orchestrator config file (YAML).
    #[arg(long, env = "LAB_ORCHESTRATOR_CONFIG")]
    config: Option<String>,

    /// Acting user id.
    #[arg(long, env = "LABCTL_USER_ID")]
    user_id: String,

    /// Acting username.
    #[arg(long, env = "LABCTL_USERNAME")]
    username: String,

    /// Acting role: student, teacher or admin.
    #[arg(long, env = "LABCTL_ROLE", default_value = "student")]
    role: Role,

    /// Run against an empty in-memory cluster instead of the current kubeconfig.
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Log as JSON lines.
    #[arg(long, default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch an application.
    Create {
        /// Application name.
        name: String,

        /// Workload type: custom, wordpress, mysql or lamp.
        #[arg(long = "type", default_value = "custom")]
        workload_type: WorkloadType,

        /// Container image (custom only).
        #[arg(long)]
        image: Option<String>,

        /// Container port (custom only).
        #[arg(long)]
        port: Option<i32>,

        /// Environment variables as KEY=VALUE (custom only).
        #[arg(long = "env", value_parser = parse_key_value)]
        env: Vec<(String, String)>,

        #[arg(long)]
        cpu_request: Option<String>,

        #[arg(long)]
        cpu_limit: Option<String>,

        #[arg(long)]
        memory_request: Option<String>,

        #[arg(long)]
        memory_limit: Option<String>,

        #[arg(long)]
        replicas: Option<i32>,

        /// Hours until the expiry sweep pauses the application.
        #[arg(long)]
        ttl_hours: Option<i64>,
    },

    /// Scale an application to zero, remembering its replicas.
    Pause(Target),

    /// Restore a paused application.
    Resume(Target),

    /// Show lifecycle state.
    Status(Target),

    /// Delete an application.
    Delete {
        #[command(flatten)]
        target: Target,

        /// Also delete services and routes.
        #[arg(long, default_value = "false")]
        delete_service: bool,

        /// Also delete the database claim and secret.
        #[arg(long, default_value = "false")]
        delete_persistent: bool,
    },

    /// Show quota usage for the acting user.
    Usage,

    /// List managed namespaces whose owner is not among the known users.
    Orphans {
        /// Known user ids (comma-separated).
        #[arg(long, value_delimiter = ',')]
        known: Vec<String>,

        /// Delete the orphaned namespaces (admin only).
        #[arg(long, default_value = "false")]
        delete: bool,
    },
}

#[derive(clap::Args)]
struct Target {
    /// Application or stack name.
    name: String,

    /// Namespace; defaults to the acting user's namespace.
    #[arg(long, short = 'n')]
    namespace: Option<String>,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_mounted_file(path)
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => OrchestratorConfig::default(),
    };
    debug!(prefix = %config.namespace_prefix, "Loaded configuration");

    if cli.dry_run {
        info!("Dry run against an in-memory cluster");
        let cluster = Arc::new(InMemoryCluster::new().with_rollout_simulation());
        run(cluster, config, cli).await
    } else {
        let cluster = KubeCluster::try_default()
            .await
            .context("Failed to connect to Kubernetes")?;
        run(Arc::new(cluster), config, cli).await
    }
}

async fn run<C: ClusterClient>(cluster: Arc<C>, config: OrchestratorConfig, cli: Cli) -> Result<()> {
    let overrides = Arc::new(StaticOverrides::new(config.quota_overrides.clone()));
    let orchestrator = DeploymentOrchestrator::new(
        cluster,
        Arc::new(config),
        overrides,
        Arc::new(InMemoryCatalog::new()),
    );
    let user = UserIdentity::new(cli.user_id, cli.username, cli.role);
    let own_namespace = orchestrator.config().namespace_for(&user.user_id);
    let namespace_of = |target: &Target| {
        target
            .namespace
            .clone()
            .unwrap_or_else(|| own_namespace.clone())
    };

    match cli.command {
        Commands::Create {
            name,
            workload_type,
            image,
            port,
            env,
            cpu_request,
            cpu_limit,
            memory_request,
            memory_limit,
            replicas,
            ttl_hours,
        } => {
            let request = CreateRequest {
                name,
                workload_type,
                image,
                port,
                env: env.into_iter().collect(),
                resources: ResourceRequest {
                    cpu_request,
                    cpu_limit,
                    memory_request,
                    memory_limit,
                    replicas,
                },
                expires_at: ttl_hours.map(|hours| Utc::now() + Duration::hours(hours)),
            };
            let outcome = orchestrator
                .create(&user, request)
                .await
                .context("Create failed")?;
            print_json(&outcome)
        }
        Commands::Pause(target) => {
            let outcome = orchestrator
                .pause(&namespace_of(&target), &target.name, &user)
                .await
                .context("Pause failed")?;
            print_json(&outcome)
        }
        Commands::Resume(target) => {
            let outcome = orchestrator
                .resume(&namespace_of(&target), &target.name, &user)
                .await
                .context("Resume failed")?;
            print_json(&outcome)
        }
        Commands::Status(target) => {
            let outcome = orchestrator
                .status(&namespace_of(&target), &target.name, &user)
                .await
                .context("Status failed")?;
            print_json(&outcome)
        }
        Commands::Delete {
            target,
            delete_service,
            delete_persistent,
        } => {
            let outcome = orchestrator
                .delete(
                    &namespace_of(&target),
                    &target.name,
                    &user,
                    delete_service,
                    delete_persistent,
                )
                .await
                .context("Delete failed")?;
            print_json(&outcome)
        }
        Commands::Usage => {
            let summary = orchestrator
                .usage_summary(&user)
                .await
                .context("Usage lookup failed")?;
            print_json(&summary)
        }
        Commands::Orphans { known, delete } => {
            let orphans = orchestrator
                .orphaned_namespaces(&known)
                .await
                .context("Namespace scan failed")?;
            if delete {
                for namespace in &orphans {
                    orchestrator
                        .delete_namespace(namespace, &user)
                        .await
                        .with_context(|| format!("Failed to delete namespace {namespace}"))?;
                }
            }
            print_json(&orphans)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{rendered}");
    Ok(())
}
