//! RPC Harness CLI
//!
//! Housekeeping against a broker management API: list the namespaces and
//! connections test runs left behind, purge leftovers, and probe that the
//! broker grants isolated namespaces at all.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rpc_harness_core::config::{HarnessConfig, LoggingConfig, ManagementConfig};
use rpc_harness_core::{BrokerAdmin, ManagementClient, Namespace, NamespaceProvisioner};

/// Integration-test harness housekeeping.
#[derive(Parser)]
#[command(name = "rpc-harness")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Override the management API URI.
    #[arg(long)]
    mgmt_uri: Option<String>,

    /// Override the management API user.
    #[arg(long)]
    user: Option<String>,

    /// Override the management API password.
    #[arg(long)]
    password: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List namespaces.
    Namespaces {
        /// Only namespaces starting with this prefix.
        #[arg(long)]
        prefix: Option<String>,
    },

    /// List open connections in a namespace.
    Connections {
        /// Namespace to inspect.
        namespace: String,
    },

    /// Delete leftover namespaces.
    Purge {
        /// Prefix of namespaces to delete; defaults to the configured prefix.
        #[arg(long)]
        prefix: Option<String>,

        /// Only report what would be deleted.
        #[arg(long)]
        dry_run: bool,
    },

    /// Create and delete a fresh namespace.
    Probe,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HarnessConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => HarnessConfig::default(),
    };

    // Apply CLI overrides
    let management = config
        .broker
        .management
        .get_or_insert_with(ManagementConfig::default);
    if let Some(uri) = args.mgmt_uri.clone() {
        management.uri = uri;
    }
    if let Some(user) = args.user.clone() {
        management.username = user;
    }
    if let Some(password) = args.password.clone() {
        management.password = password;
    }

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };

    setup_tracing(&log_config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run(args.command, config).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn run(command: Command, config: HarnessConfig) -> anyhow::Result<()> {
    let management = config.broker.management.clone().unwrap_or_default();
    let client = ManagementClient::new(&management)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        management = %client.base_uri(),
        "connecting to management api"
    );
    let admin: Arc<dyn BrokerAdmin> = Arc::new(client);
    let provisioner = NamespaceProvisioner::new(Arc::clone(&admin), config.namespace.clone());

    match command {
        Command::Namespaces { prefix } => {
            for vhost in matching_vhosts(admin.as_ref(), prefix.as_deref()).await? {
                println!("{vhost}");
            }
        }
        Command::Connections { namespace } => {
            let connections = admin.list_connections(&namespace).await?;
            if connections.is_empty() {
                info!(namespace = %namespace, "no open connections");
            }
            for connection in connections {
                println!("{connection}");
            }
        }
        Command::Purge { prefix, dry_run } => {
            let prefix = prefix.unwrap_or_else(|| provisioner.prefix().to_string());
            purge(&provisioner, &prefix, dry_run).await?;
        }
        Command::Probe => {
            let namespace = provisioner.create().await?;
            println!("created {namespace}");
            provisioner.delete(&namespace).await?;
            println!("deleted {namespace}");
        }
    }

    Ok(())
}

async fn matching_vhosts(admin: &dyn BrokerAdmin, prefix: Option<&str>) -> anyhow::Result<Vec<String>> {
    let mut vhosts = admin.list_vhosts().await?;
    if let Some(prefix) = prefix {
        vhosts.retain(|vhost| vhost.starts_with(prefix));
    }
    vhosts.sort();
    Ok(vhosts)
}

async fn purge(provisioner: &NamespaceProvisioner, prefix: &str, dry_run: bool) -> anyhow::Result<()> {
    if prefix.is_empty() {
        bail!("refusing to purge with an empty prefix");
    }

    let leftovers = matching_vhosts(provisioner.admin().as_ref(), Some(prefix)).await?;
    info!(prefix = %prefix, count = leftovers.len(), dry_run, "purging namespaces");

    let mut failed = 0usize;
    for name in leftovers {
        if dry_run {
            println!("would delete {name}");
            continue;
        }
        match provisioner.delete(&Namespace::from_name(&name)).await {
            Ok(()) => println!("deleted {name}"),
            Err(e) => {
                warn!(namespace = %name, error = %e, "failed to delete namespace");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} namespace(s) could not be deleted");
    }
    Ok(())
}
