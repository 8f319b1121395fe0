//! FlowVPN command-line front end
//!
//! Inspects a subscription without touching the tunnel: list its
//! nodes, probe them, print the engine config a session would use,
//! or write a sample settings file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowvpn_core::{
    ConfigStore, ConfigTranslator, LatencyProber, ProbeProgress, SessionConfig, StaticProfile, SubscriptionConfig,
};
use flowvpn_network::HostResolver;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// FlowVPN - subscription-driven VPN session manager
#[derive(Parser)]
#[command(name = "flowvpn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (.toml or .json)
    #[arg(short, long, default_value = "flowvpn.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the nodes of a subscription
    Nodes {
        /// Subscription URL (defaults to the configured one)
        #[arg(short, long)]
        url: Option<String>,
    },

    /// Measure connect latency of every eligible node
    Probe {
        /// Subscription URL (defaults to the configured one)
        #[arg(short, long)]
        url: Option<String>,

        /// Probe a second time, only nodes that failed or were slow
        #[arg(long)]
        retest: bool,
    },

    /// Print the engine config a session would start with
    Translate {
        /// Subscription URL (defaults to the configured one)
        #[arg(short, long)]
        url: Option<String>,

        /// Node to select (defaults to the configured selection)
        #[arg(short, long)]
        node: Option<String>,

        /// Tunnel descriptor to embed
        #[arg(long, default_value_t = 0)]
        fd: i32,

        /// Use the static profile instead of the subscription
        #[arg(long = "static")]
        use_static: bool,
    },

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "flowvpn.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Nodes { url } => list_nodes(&load_config(&cli.config)?, url).await,
        Commands::Probe { url, retest } => probe_nodes(&load_config(&cli.config)?, url, retest).await,
        Commands::Translate {
            url,
            node,
            fd,
            use_static,
        } => translate(&load_config(&cli.config)?, url, node, fd, use_static).await,
        Commands::GenConfig { output } => generate_config(&output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();
}

fn load_config(path: &Path) -> Result<SessionConfig> {
    if !path.exists() {
        warn!("Config {} not found, using defaults", path.display());
        return Ok(SessionConfig::default());
    }
    SessionConfig::from_file(path).with_context(|| format!("Failed to load config from {}", path.display()))
}

async fn fetch_subscription(config: &SessionConfig, url: Option<String>) -> Result<Arc<SubscriptionConfig>> {
    let url = match url.as_deref().or(config.settings.active_subscription()) {
        Some(url) => url.to_string(),
        None => bail!("No subscription URL: pass --url or set settings.subscription_url"),
    };

    let store = ConfigStore::with_defaults();
    store
        .fetch(&url)
        .await
        .with_context(|| format!("Failed to fetch subscription {}", url))
}

async fn list_nodes(config: &SessionConfig, url: Option<String>) -> Result<()> {
    let subscription = fetch_subscription(config, url).await?;

    for node in subscription.nodes() {
        let marker = if config.filter.is_eligible(node) { "*" } else { " " };
        println!("{} {:<32} {:<4} {}:{}", marker, node.name, node.kind, node.server, node.port);
    }

    let eligible = subscription.eligible(&config.filter).count();
    println!();
    println!("{} nodes, {} eligible (*)", subscription.len(), eligible);
    Ok(())
}

async fn probe_nodes(config: &SessionConfig, url: Option<String>, retest: bool) -> Result<()> {
    let subscription = fetch_subscription(config, url).await?;
    let resolver = HostResolver::with_defaults()
        .await
        .context("Failed to create DNS resolver")?;
    resolver.pre_resolve_all(subscription.server_hosts()).await;

    let prober = LatencyProber::new(resolver, config.probe.clone());
    let (tx, mut rx) = mpsc::unbounded_channel::<ProbeProgress>();
    let reporter = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            info!("Probed {}/{}", progress.completed, progress.total);
        }
    });

    let mut summary = prober.test_all(&subscription, &config.filter, Some(&tx)).await;
    if retest {
        let again = prober.retest_failed(&subscription, &config.filter, Some(&tx)).await;
        info!("Retested {} nodes, {} now reachable", again.total, again.reachable);
        summary.reachable += again.reachable;
        summary.timed_out = summary.timed_out.saturating_sub(again.reachable);
    }
    drop(tx);
    reporter.await.context("Progress reporter failed")?;

    let table = prober.table();
    for node in table.sorted(&subscription) {
        if !config.filter.is_eligible(node) {
            continue;
        }
        let latency = table.latency(&node.name);
        println!("{:<32} {:>9} {:?}", node.name, latency.label(), latency.grade());
    }

    println!();
    println!(
        "{} probed, {} reachable, {} timed out",
        summary.total, summary.reachable, summary.timed_out
    );
    if let Some(fastest) = table.fastest(&subscription, &config.filter) {
        println!("Fastest: {} ({})", fastest.name, table.latency(&fastest.name));
    }
    Ok(())
}

async fn translate(
    config: &SessionConfig,
    url: Option<String>,
    node: Option<String>,
    fd: i32,
    use_static: bool,
) -> Result<()> {
    let resolver = HostResolver::with_defaults()
        .await
        .context("Failed to create DNS resolver")?;
    let translator = ConfigTranslator::new(config.filter.clone(), config.tunnel.mtu);

    let engine_config = if use_static {
        let profile: &StaticProfile = config
            .static_profile
            .as_ref()
            .context("No static_profile in configuration")?;
        resolver.resolve(&profile.server).await;
        translator.translate_static(profile, fd, &resolver)
    } else {
        let subscription = fetch_subscription(config, url).await?;
        resolver.pre_resolve_all(subscription.server_hosts()).await;

        let selected = node.or_else(|| config.settings.selected_node.clone());
        let translation = translator
            .translate(&subscription, fd, selected.as_deref(), &resolver)
            .context("Failed to translate subscription")?;
        info!("Selected node: {}", translation.node_name);
        translation.config
    };

    println!("{}", engine_config.to_json_pretty()?);
    Ok(())
}

fn generate_config(output: &Path) -> Result<()> {
    let mut config = SessionConfig::default();
    config.settings.subscription_url = Some("https://example.com/subscription/clash".to_string());
    config.settings.use_subscription = true;
    config.static_profile = Some(StaticProfile {
        password: Some("change-me".to_string()),
        ..StaticProfile::new("203.0.113.10", 8388)
    });

    let content = config.render_for(output).context("Failed to render configuration")?;
    std::fs::write(output, content).with_context(|| format!("Failed to write {}", output.display()))?;

    println!("Sample configuration written to {}", output.display());
    Ok(())
}
