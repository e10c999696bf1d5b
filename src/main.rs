//! HostProxy - Main entry point
//!
//! Domain and path based HTTP/HTTPS reverse proxy and static file gateway

use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::Parser;
use hostproxy::{CertificateResolver, Config, ProxyConfig, ProxyServer, RouteStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// HostProxy - reverse proxy and static file gateway
#[derive(Parser, Debug)]
#[command(name = "hostproxy")]
#[command(author = "HostProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Domain and path based HTTP/HTTPS reverse proxy and static file gateway")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "52080")]
    http_port: u16,

    /// HTTPS port to listen on; negative disables HTTPS
    #[arg(long, env = "HTTPS_PORT", default_value = "-1", allow_hyphen_values = true)]
    https_port: i32,

    /// Volume holding config.json and static folders
    #[arg(long, env = "VOLUME_PATH", default_value = "./vol")]
    volume_path: PathBuf,

    /// Root of the certificate bundles
    #[arg(long, env = "CERTS_PATH", default_value = "/etc/letsencrypt/live/")]
    certs_path: PathBuf,

    /// Read certificate bundles from the volume instead of the certs path
    #[arg(long, env = "LOAD_CERTS_FROM_VOLUME", value_parser = BoolishValueParser::new())]
    load_certs_from_volume: bool,

    /// Issue self-signed certificates for routed domains without one
    #[arg(long, env = "AUTO_CERTS", value_parser = BoolishValueParser::new())]
    auto_certs: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds allowed for connecting to an upstream
    #[arg(long, env = "UPSTREAM_CONNECT_TIMEOUT", default_value = "10")]
    upstream_connect_timeout: u64,

    /// Seconds allowed for an upstream to start responding
    #[arg(long, env = "UPSTREAM_RESPONSE_TIMEOUT", default_value = "60")]
    upstream_response_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting HostProxy v{}", env!("CARGO_PKG_VERSION"));

    let https_port = https_listener_port(args.https_port)?;
    let certs_root = if args.load_certs_from_volume {
        info!("Loading certificates from volume");
        args.volume_path.clone()
    } else {
        args.certs_path.clone()
    };

    info!("HTTP port: {}", args.http_port);
    match https_port {
        Some(port) => info!("HTTPS port: {}", port),
        None => info!("HTTPS disabled"),
    }
    info!("Volume path: {}", args.volume_path.display());
    info!("Certificates path: {}", certs_root.display());
    info!("Auto certificates: {}", args.auto_certs);

    let config = Config::load(&args.volume_path).context("Failed to load configuration")?;
    let routes = RouteStore::from_config(&config);
    info!("Routing {} domain(s)", routes.load().len());

    let certificates = Arc::new(CertificateResolver::new(
        &certs_root,
        routes.clone(),
        args.auto_certs,
    ));
    if https_port.is_some() {
        let loaded = certificates
            .preload()
            .context("Failed to load declared certificates")?;
        info!("Preloaded {} certificate(s)", loaded);
    }

    #[cfg(unix)]
    spawn_reload(args.volume_path.clone(), routes.clone())?;

    let config = ProxyConfig {
        http_port: args.http_port,
        https_port,
        volume_path: args.volume_path,
        connect_timeout: Duration::from_secs(args.upstream_connect_timeout),
        response_timeout: Duration::from_secs(args.upstream_response_timeout),
    };

    let server = Arc::new(ProxyServer::new(config, routes, certificates));

    info!("HostProxy started successfully");

    server.run().await?;

    Ok(())
}

/// Negative ports disable HTTPS; anything else must be a valid port
fn https_listener_port(value: i32) -> Result<Option<u16>> {
    if value < 0 {
        return Ok(None);
    }
    match u16::try_from(value) {
        Ok(port) => Ok(Some(port)),
        Err(_) => bail!("HTTPS port {} is out of range", value),
    }
}

/// Re-read config.json on SIGHUP; a broken file keeps the current routes
#[cfg(unix)]
fn spawn_reload(volume_path: PathBuf, routes: RouteStore) -> Result<()> {
    use hostproxy::RouteTable;
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match Config::read(&volume_path) {
                Ok(config) => {
                    let table = RouteTable::from_config(&config);
                    info!("Reloaded configuration with {} domain(s)", table.len());
                    routes.replace(table);
                }
                Err(e) => warn!("Reload failed, keeping current routes: {}", e),
            }
        }
    });

    Ok(())
}
