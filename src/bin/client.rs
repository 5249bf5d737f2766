//! Mirage Tunnel Client
//!
//! Opens the persistent datastore, ingests a server list, and establishes
//! an obfuscated, browser-shaped tunnel to the best available candidate.

use anyhow::{Context, Result};
use clap::Parser;
use mirage_tunnel::config::Config;
use mirage_tunnel::dial::{deadline_token, establish_tunnel, EstablishConfig};
use mirage_tunnel::params::Parameters;
use mirage_tunnel::store::{entries::decode_server_entry, Datastore};
use mirage_tunnel::tls::TcpDialer;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Mirage Tunnel Client - censorship-circumvention tunnel establishment
#[derive(Parser, Debug)]
#[command(name = "mirage-client")]
#[command(about = "Mirage Tunnel Client - obfuscated tunnel establishment")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Server list file (hex-encoded entries, one per line; overrides config)
    #[arg(short, long)]
    server_list: Option<String>,

    /// Egress region (overrides config)
    #[arg(short, long)]
    region: Option<String>,

    /// Overall establishment deadline in seconds
    #[arg(long, default_value_t = 300)]
    establish_timeout: u64,

    /// Generate an example configuration file and exit
    #[arg(long)]
    generate_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    if args.generate_config {
        let config = Config::default();
        config
            .save(&args.config)
            .context("failed to write example config")?;
        info!(path = args.config.as_str(), "wrote example configuration");
        return Ok(());
    }

    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("failed to load config")?
    } else {
        warn!(
            path = args.config.as_str(),
            "config file not found; using defaults"
        );
        Config::default()
    };

    if let Some(region) = args.region {
        config.client.egress_region = region;
    }
    if let Some(server_list) = args.server_list {
        config.client.server_list_file = Some(server_list);
    }

    let store = Arc::new(
        Datastore::open(Path::new(&config.client.data_store_directory))
            .context("failed to open datastore")?,
    );

    if let Some(server_list_file) = &config.client.server_list_file {
        let content =
            std::fs::read_to_string(server_list_file).context("failed to read server list")?;
        let stored = store
            .store_server_list(content.lines().map(str::to_string), false)
            .context("failed to ingest server list")?;
        info!(
            stored,
            total = store.count_server_entries(),
            "ingested server list"
        );
    }

    if store.count_server_entries() == 0 && config.client.target_server_entry.is_none() {
        anyhow::bail!("no server entries available; supply a server list or target entry");
    }

    let target_server_entry = config
        .client
        .target_server_entry
        .as_deref()
        .map(decode_server_entry)
        .transpose()
        .context("invalid target server entry")?;

    let params = Arc::new(Parameters::new());
    let establish_config = EstablishConfig {
        store,
        params,
        filter: config.client.server_entry_filter(),
        network_id: config.client.network_id.clone(),
        target_server_entry,
        raw_dialer: Arc::new(TcpDialer),
        skip_verify: config.client.skip_certificate_verification,
    };

    let root_token = CancellationToken::new();
    let shutdown = root_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; canceling establishment");
            shutdown.cancel();
        }
    });

    let token = deadline_token(&root_token, Duration::from_secs(args.establish_timeout));
    let established = establish_tunnel(&token, &establish_config)
        .await
        .context("tunnel establishment failed")?;

    // Server identifiers stay out of logs unless the operator opted in.
    let server_label = if config.logging.redact_identifiers {
        "[redacted]".to_string()
    } else {
        established.server_entry.ip_address.clone()
    };
    info!(
        server = server_label.as_str(),
        profile = established.dial_params.tls_profile.as_str(),
        replayed = established.replayed,
        http2 = established.conn.is_http2(),
        ja3 = established.conn.ja3_hash().as_str(),
        "tunnel ready"
    );

    // The inner channel (SSH) attaches here; establishment is this binary's
    // job, so hold the tunnel open until interrupted.
    root_token.cancelled().await;
    established.conn.close().await.ok();
    Ok(())
}
