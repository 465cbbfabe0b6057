//! ribbon: run a client-side load balancer from a TOML file.
//!
//! ```text
//! ribbon run      load config → build load balancer → pinger + list updater
//!                 + config watcher → periodic selection report → Ctrl-C
//! ribbon check    validate the config and print it as JSON
//! ribbon snapshot build, run one ping cycle, print the pool state as JSON
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use ribbon::config::loader::load_config;
use ribbon::config::watcher::ConfigWatcher;
use ribbon::lifecycle::{wait_for_shutdown_signal, Shutdown};
use ribbon::load_balancer::dynamic::{ConfigServerList, DynamicServerListLoadBalancer};
use ribbon::load_balancer::filter::ZonePreferenceServerListFilter;
use ribbon::observability::metrics::init_metrics;
use ribbon::observability::{logging, MetricsSink, NoopMetrics, PrometheusMetrics};
use ribbon::{BaseLoadBalancer, LoadBalancer, RibbonConfig, Registry};

#[derive(Parser)]
#[command(name = "ribbon")]
#[command(about = "Client-side load balancer with health checked server pools", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "ribbon.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the load balancer until interrupted
    Run {
        /// Seconds between selection reports.
        #[arg(long, default_value_t = 5)]
        report_interval_secs: u64,

        /// Selection key passed to the rule.
        #[arg(long)]
        key: Option<String>,
    },
    /// Validate the configuration and print it
    Check,
    /// Run one health check cycle and print the server pool
    Snapshot,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            logging::init("info");
            tracing::error!(path = ?cli.config, error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };
    logging::init(&config.observability.log_level);

    match cli.command {
        Commands::Check => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Snapshot => {
            let lb = build(&config, &cli.config, Arc::new(NoopMetrics))?;
            lb.base().force_quick_ping().await;
            println!("{}", serde_json::to_string_pretty(&lb.base().snapshot())?);
            Ok(())
        }
        Commands::Run {
            report_interval_secs,
            key,
        } => run(config, &cli.config, report_interval_secs, key).await,
    }
}

fn build(
    config: &RibbonConfig,
    path: &Path,
    metrics: Arc<dyn MetricsSink>,
) -> Result<Arc<DynamicServerListLoadBalancer>, Box<dyn std::error::Error>> {
    let client_config = config.client.client_config();
    let base = BaseLoadBalancer::from_config(client_config.clone(), &Registry::default(), metrics)?;
    let filter = Arc::new(ZonePreferenceServerListFilter::new(&client_config, base.stats_handle()));
    let lb = DynamicServerListLoadBalancer::new(base, Arc::new(ConfigServerList::new(path)), Some(filter));

    let servers = lb.initialize()?;
    tracing::info!(
        client = %config.client.name,
        servers,
        rule = lb.base().rule_name().unwrap_or("none"),
        "Load balancer ready"
    );
    Ok(lb)
}

async fn run(
    config: RibbonConfig,
    path: &Path,
    report_interval_secs: u64,
    key: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("ribbon v{} starting", env!("CARGO_PKG_VERSION"));

    let metrics: Arc<dyn MetricsSink> = if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                init_metrics(addr);
                Arc::new(PrometheusMetrics)
            }
            Err(_) => {
                tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    "Failed to parse metrics address"
                );
                Arc::new(NoopMetrics)
            }
        }
    } else {
        Arc::new(NoopMetrics)
    };

    let lb = build(&config, path, metrics)?;
    lb.base().force_quick_ping().await;

    let shutdown = Shutdown::new();
    lb.base().start_ping_task(shutdown.subscribe());
    lb.start_updater(shutdown.subscribe());

    let (watcher, mut updates) = ConfigWatcher::new(path);
    // Dropping the watcher stops it.
    let _watcher = match watcher.run() {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, relying on periodic refresh");
            None
        }
    };

    let mut report = tokio::time::interval(Duration::from_secs(report_interval_secs.max(1)));
    let signal = wait_for_shutdown_signal();
    tokio::pin!(signal);

    loop {
        tokio::select! {
            _ = report.tick() => {
                match lb.choose_server(key.as_deref()) {
                    Some(server) => tracing::info!(server = %server, zone = server.zone(), "Selected server"),
                    None => tracing::warn!("No server available"),
                }
                match serde_json::to_string(&lb.base().snapshot()) {
                    Ok(json) => tracing::debug!(snapshot = %json, "Pool state"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize pool state"),
                }
            }
            Some(new_config) = updates.recv() => {
                let servers = new_config
                    .client
                    .parsed_servers()
                    .into_iter()
                    .map(Arc::new)
                    .collect();
                let applied = lb.apply(servers);
                tracing::info!(servers = applied, "Server list reloaded from config file");
            }
            _ = &mut signal => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    shutdown.trigger();
    lb.stop_updater();
    lb.base().shutdown();
    tracing::info!("Shutdown complete");
    Ok(())
}
