mod admin;
mod catalog;
mod cli;
mod config;
mod error;
mod guard;
mod http;
mod ports;
mod qan;
mod reconcile;
mod supervisor;

use std::sync::Arc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use anyhow::{bail, Context, Result};
use shared::protocol::QAN_API_PREFIX;
use crate::admin::{Admin, LocalLayout};
use crate::catalog::consul::ConsulClient;
use crate::catalog::{Catalog, NodeCatalog};
use crate::cli::{AddTarget, Args, Command, Product};
use crate::config::Config;
use crate::error::AdminError;
use crate::http::HttpSettings;
use crate::qan::agent::{AgentRegistration, InstallerCommand};
use crate::qan::client::QanClient;
use crate::qan::rendezvous::AgentRendezvous;
use crate::qan::QanApi;
use crate::supervisor::{ServiceManager, SystemdManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pmm_admin=info"))
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if config.client.address.is_empty() {
        bail!("client.address is not set in {}", args.config.display());
    }
    let node_name = config.client_name()?;
    tracing::debug!(
        "Node {} ({}), server {}",
        node_name,
        config.client.address,
        config.server_url()
    );

    let settings = HttpSettings {
        timeout: config.timeout(),
        insecure_ssl: config.server.insecure_ssl,
        user: config.server.user.clone(),
        password: config.server.password.clone(),
    };
    let server_url = config.server_url();

    let catalog: Arc<dyn Catalog> = Arc::new(ConsulClient::new(&server_url, &settings)?);
    let qan: Arc<dyn QanApi> = Arc::new(QanClient::new(&server_url, &settings)?);
    let supervisor: Arc<dyn ServiceManager> = Arc::new(SystemdManager::new(&config.paths.unit_dir));

    let mut installer_args = vec!["-mysql=false".to_string()];
    if config.server.insecure_ssl {
        installer_args.push("-server-insecure-ssl".to_string());
    }
    installer_args.push(format!("{}{}", server_url, QAN_API_PREFIX));
    let installer = Arc::new(InstallerCommand::new(
        config.paths.qan_base.join("bin").join("percona-qan-agent-installer"),
        installer_args,
    ));
    let registration = Arc::new(AgentRegistration::new(
        &config.paths.qan_base,
        installer,
        qan.clone(),
    ));

    // Create cancellation token for the agent command relay
    let cancel = CancellationToken::new();
    let rendezvous = Arc::new(
        AgentRendezvous::new(qan, registration.instance_dir(), format!("pmm-admin@{}", node_name))
            .with_cancel(cancel.clone()),
    );

    let admin = Admin::new(
        NodeCatalog::new(catalog, node_name.clone(), config.client.address.clone()),
        supervisor,
        rendezvous,
        registration,
        LocalLayout {
            bin_dir: config.paths.bin_dir.clone(),
            qan_base: config.paths.qan_base.clone(),
            bind_address: config.bind_address().to_string(),
        },
    );

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling");
            signal_cancel.cancel();
        }
    });

    let result = run(&admin, &node_name, args.command).await;
    if let Err(e) = &result {
        if let Some(subsystem) = e.downcast_ref::<AdminError>().and_then(AdminError::subsystem) {
            tracing::debug!("Failure originated in the {}", subsystem);
        }
    }
    result
}

async fn run(admin: &Admin, node_name: &str, command: Command) -> Result<()> {
    match command {
        Command::Add(add) => {
            let product = add.product;
            let result = match add.into_target(node_name).map_err(anyhow::Error::msg)? {
                AddTarget::Metrics(target) => admin.add_metrics(target).await,
                AddTarget::Queries(target) => admin.add_queries(target).await,
            };
            let record = result.with_context(|| format!("Failed to add {}", product))?;
            println!(
                "OK, now monitoring {} on port {} ({})",
                product,
                record.port,
                record.local_name()
            );
        }
        Command::Remove { product, alias } => {
            let alias = alias.unwrap_or_else(|| node_name.to_string());
            let result = match product {
                Product::Metrics(service_type) => admin.remove_metrics(service_type, &alias).await,
                Product::Queries(subsystem) => admin.remove_queries(subsystem, &alias).await,
            };
            result.with_context(|| format!("Failed to remove {} {}", product, alias))?;
            println!("OK, removed {} {}", product, alias);
        }
        Command::RemoveAll { ignore_errors } => {
            let removed = admin.remove_all(ignore_errors).await?;
            for item in &removed {
                println!("removed {}", item);
            }
            println!("OK, {} services removed", removed.len());
        }
        Command::List => {
            let statuses = admin.list().await?;
            if statuses.is_empty() {
                println!("No services under monitoring on {}", node_name);
                return Ok(());
            }
            println!(
                "{:<18} {:<26} {:<6} {:<8} {}",
                "SERVICE TYPE", "LOCAL SERVICE", "PORT", "RUNNING", "ALIASES"
            );
            for status in statuses {
                let aliases: Vec<&str> =
                    status.record.meta.aliases.iter().map(String::as_str).collect();
                println!(
                    "{:<18} {:<26} {:<6} {:<8} {}",
                    status.record.service_type.as_str(),
                    status.local_name,
                    status.record.port,
                    if status.running { "YES" } else { "NO" },
                    aliases.join(", ")
                );
            }
        }
        Command::Repair { ignore_errors } => {
            let report = admin.reconciliation().repair(ignore_errors).await?;
            if report.is_empty() {
                println!("OK, nothing to repair");
                return Ok(());
            }
            for name in &report.uninstalled {
                println!("uninstalled orphaned local service {}", name);
            }
            for uuid in &report.soft_deleted {
                println!("deleted QAN instance {}", uuid);
            }
            for id in &report.deregistered {
                println!("removed catalog record {}", id);
            }
            if !report.failed.is_empty() {
                bail!(
                    "{} items could not be repaired:\n{}",
                    report.failed.len(),
                    report.failed.join("\n")
                );
            }
        }
        Command::Ping => {
            let version = admin.ping().await.context("PMM server is not reachable")?;
            println!("OK, PMM server is alive (QAN API {})", version);
        }
    }
    Ok(())
}
