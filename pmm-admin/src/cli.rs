use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use clap::{Parser, Subcommand};
use shared::types::{ServiceMeta, ServiceType, Subsystem};
use crate::admin::{MetricsTarget, QueriesTarget};
use crate::config::DEFAULT_CONFIG_PATH;

#[derive(Parser)]
#[command(name = "pmm-admin")]
#[command(about = "Manage monitoring services of this node on a PMM server", long_about = None)]
pub struct Args {
    /// Path to the client config file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Enable monitoring of a target.
    Add(AddArgs),
    /// Disable monitoring of a target.
    Remove {
        product: Product,
        /// Defaults to the client name.
        alias: Option<String>,
    },
    /// Disable every service of this node.
    RemoveAll {
        /// Keep going after a failure and report all failures at the end.
        #[arg(long, default_value_t = false)]
        ignore_errors: bool,
    },
    /// Show the services of this node and whether they run.
    List,
    /// Remove local services and catalog records that lost their counterpart.
    Repair {
        #[arg(long, default_value_t = false)]
        ignore_errors: bool,
    },
    /// Check that the PMM server answers.
    Ping,
}

#[derive(clap::Args)]
pub struct AddArgs {
    /// linux:metrics, mysql:metrics, mongodb:metrics, proxysql:metrics,
    /// mysql:queries or mongodb:queries.
    pub product: Product,
    /// Defaults to the client name.
    pub alias: Option<String>,
    /// Port for the exporter; the first free one from the default when unset.
    #[arg(long, default_value_t = 0)]
    pub port: u16,
    #[arg(long)]
    pub dsn: Option<String>,
    /// MySQL query source: slowlog or perfschema.
    #[arg(long)]
    pub query_source: Option<String>,
    #[arg(long)]
    pub cluster: Option<String>,
    #[arg(long)]
    pub replset: Option<String>,
    #[arg(long)]
    pub nodetype: Option<String>,
    /// Extra exporter flag as name=value; repeatable.
    #[arg(long = "option", value_parser = parse_option, allow_hyphen_values = true)]
    pub options: Vec<(String, String)>,
    /// Database distribution reported to query analytics.
    #[arg(long, default_value = "")]
    pub distro: String,
    /// Database version reported to query analytics.
    #[arg(long, default_value = "")]
    pub db_version: String,
}

/// What the user asks to monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    Metrics(ServiceType),
    Queries(Subsystem),
}

impl FromStr for Product {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql:queries" => Ok(Product::Queries(Subsystem::Mysql)),
            "mongodb:queries" => Ok(Product::Queries(Subsystem::Mongo)),
            "queries" => Err("use mysql:queries or mongodb:queries".to_string()),
            other => other.parse::<ServiceType>().map(Product::Metrics),
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Product::Metrics(t) => write!(f, "{}", t),
            Product::Queries(s) => f.write_str(s.product()),
        }
    }
}

fn parse_option(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{}'", s))?;
    let name = name.trim_start_matches('-');
    if name.is_empty() {
        return Err(format!("empty option name in '{}'", s));
    }
    Ok((name.to_string(), value.to_string()))
}

/// An add request resolved against the client defaults.
#[derive(Debug, Clone)]
pub enum AddTarget {
    Metrics(MetricsTarget),
    Queries(QueriesTarget),
}

impl AddArgs {
    pub fn into_target(self, default_alias: &str) -> Result<AddTarget, String> {
        let alias = self.alias.unwrap_or_else(|| default_alias.to_string());
        let meta = ServiceMeta {
            node_type: self.nodetype,
            replset: self.replset,
            cluster: self.cluster,
            ..Default::default()
        };

        match self.product {
            Product::Metrics(service_type) => Ok(AddTarget::Metrics(MetricsTarget {
                service_type,
                alias,
                port: self.port,
                dsn: self.dsn,
                meta,
                options: self.options.into_iter().collect::<BTreeMap<_, _>>(),
            })),
            Product::Queries(subsystem) => {
                let dsn = self
                    .dsn
                    .ok_or_else(|| format!("--dsn is required for {}", subsystem.product()))?;
                Ok(AddTarget::Queries(QueriesTarget {
                    subsystem,
                    alias,
                    dsn,
                    meta,
                    query_source: self.query_source,
                    distro: self.distro,
                    version: self.db_version,
                }))
            }
        }
    }
}
