use anyhow::Context;
use clap::Parser;
use pkg_constants::{network, paths};
use pkg_network::allocator::parse_cidr;
use pkg_proxy::iptables::CommandExecutor;
use pkg_proxy::{MemoryTables, PacketFilter, ProxyConfig, Reconciler, ServiceHandler, SystemExecutor};
use pkg_state::HttpStore;
use pkg_types::config::{ProxyConfigFile, load_config_file};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Default)]
#[command(name = "k3rs-proxy", about = "k3rs node service proxy (iptables)")]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = paths::DEFAULT_PROXY_CONFIG)]
    config: String,

    /// Store API address
    #[arg(long)]
    server: Option<String>,

    /// Only watch pods scheduled on this node
    #[arg(long)]
    node_name: Option<String>,

    /// Pod network CIDR
    #[arg(long)]
    cluster_cidr: Option<String>,

    /// CIDR ClusterIPs are allocated from
    #[arg(long)]
    service_cidr: Option<String>,

    /// Maximum reconciliations running at once
    #[arg(long)]
    workers: Option<usize>,

    /// Path to the iptables binary
    #[arg(long)]
    iptables: Option<String>,

    /// Program an in-memory table instead of the host
    #[arg(long)]
    dry_run: bool,
}

/// Settings after merging CLI args > config file > defaults.
#[derive(Debug)]
struct Settings {
    server: String,
    iptables: String,
    dry_run: bool,
    proxy: ProxyConfig,
}

fn merge(cli: Cli, file: ProxyConfigFile) -> anyhow::Result<Settings> {
    let server = cli
        .server
        .or(file.server)
        .unwrap_or_else(|| network::DEFAULT_API_ADDR.to_string());
    let iptables = cli
        .iptables
        .or(file.iptables)
        .unwrap_or_else(|| paths::DEFAULT_IPTABLES_PATH.to_string());
    let dry_run = cli.dry_run || file.dry_run.unwrap_or(false);

    let service_cidr = cli
        .service_cidr
        .or(file.service_cidr)
        .unwrap_or_else(|| network::DEFAULT_SERVICE_CIDR.to_string());
    let cluster_cidr = cli
        .cluster_cidr
        .or(file.cluster_cidr)
        .unwrap_or_else(|| network::DEFAULT_CLUSTER_CIDR.to_string());

    let proxy = ProxyConfig {
        service_cidr: parse_cidr(&service_cidr).context("service-cidr")?,
        cluster_cidr: parse_cidr(&cluster_cidr).context("cluster-cidr")?,
        node_name: cli.node_name.or(file.node_name),
        workers: cli
            .workers
            .or(file.workers)
            .unwrap_or(network::DEFAULT_PROXY_WORKERS),
        ..ProxyConfig::default()
    };

    Ok(Settings {
        server,
        iptables,
        dry_run,
        proxy,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ProxyConfigFile = load_config_file(&cli.config)?;
    info!("Config file: {}", cli.config);

    let settings = merge(cli, file_cfg)?;

    info!("Starting k3rs-proxy");
    info!("  Server:       {}", settings.server);
    info!(
        "  Node:         {}",
        settings.proxy.node_name.as_deref().unwrap_or("(all)")
    );
    info!("  Service CIDR: {}", settings.proxy.service_cidr);
    info!("  Cluster CIDR: {}", settings.proxy.cluster_cidr);
    info!("  Workers:      {}", settings.proxy.workers);
    if settings.dry_run {
        info!("  Dry run:      iptables changes are only logged");
    } else {
        info!("  iptables:     {}", settings.iptables);
    }

    let store = Arc::new(HttpStore::new(&settings.server)?);
    let executor: Arc<dyn CommandExecutor> = if settings.dry_run {
        Arc::new(MemoryTables::dry_run())
    } else {
        Arc::new(SystemExecutor::new(&settings.iptables))
    };
    let filter = PacketFilter::new(executor);

    filter
        .init_services_chain()
        .await
        .context("Failed to initialize service chains")?;
    filter
        .init_node_port_chain()
        .await
        .context("Failed to initialize node port chain")?;

    let config = Arc::new(settings.proxy);
    let handler = ServiceHandler::new(store, filter, config.clone());
    let reconciler = Reconciler::new(handler, &config).start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutting down k3rs-proxy"),
        res = reconciler => {
            res?;
            info!("Watches closed, exiting");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let cli = Cli {
            server: Some("http://cli:6443".to_string()),
            workers: Some(2),
            ..Cli::default()
        };
        let file = ProxyConfigFile {
            server: Some("http://file:6443".to_string()),
            node_name: Some("worker-1".to_string()),
            service_cidr: Some("10.100.0.0/24".to_string()),
            dry_run: Some(true),
            ..ProxyConfigFile::default()
        };

        let settings = merge(cli, file).unwrap();

        assert_eq!(settings.server, "http://cli:6443");
        assert_eq!(settings.proxy.workers, 2);
        assert_eq!(settings.proxy.node_name.as_deref(), Some("worker-1"));
        assert_eq!(settings.proxy.service_cidr.to_string(), "10.100.0.0/24");
        assert_eq!(settings.proxy.cluster_cidr.to_string(), network::DEFAULT_CLUSTER_CIDR);
        assert_eq!(settings.iptables, paths::DEFAULT_IPTABLES_PATH);
        assert!(settings.dry_run);
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        let cli = Cli {
            cluster_cidr: Some("not-a-cidr".to_string()),
            ..Cli::default()
        };
        let err = merge(cli, ProxyConfigFile::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("cluster-cidr"));
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::parse_from([
            "k3rs-proxy",
            "--node-name",
            "n1",
            "--dry-run",
            "--workers",
            "3",
        ]);
        assert_eq!(cli.config, paths::DEFAULT_PROXY_CONFIG);
        assert_eq!(cli.node_name.as_deref(), Some("n1"));
        assert!(cli.dry_run);
        assert_eq!(cli.workers, Some(3));
    }
}
