//! Vantage - intercepting HTTP/HTTPS/WebSocket proxy
//!
//! CLI entry point: loads configuration, initializes logging, and runs the
//! proxy until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vantage::{Callbacks, Config, ProxyServer};

/// Intercepting HTTP/HTTPS/WebSocket proxy
#[derive(Parser, Debug)]
#[command(name = "vantage")]
#[command(author, version, about = "Intercepting HTTP/HTTPS/WebSocket proxy", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "VANTAGE_CONFIG")]
    config: Option<String>,

    /// Listen address
    #[arg(long, env = "VANTAGE_HOST")]
    host: Option<String>,

    /// Listen port
    #[arg(short, long, env = "VANTAGE_PORT")]
    port: Option<u16>,

    /// Proxy username
    #[arg(long, env = "VANTAGE_USER")]
    user: Option<String>,

    /// Proxy password
    #[arg(long, env = "VANTAGE_PASSWORD")]
    password: Option<String>,

    /// Upstream proxy URL (http:// or socks5://)
    #[arg(long, env = "VANTAGE_UPSTREAM")]
    upstream: Option<String>,

    /// Mimic a Chrome TLS ClientHello on origin connections
    #[arg(long, env = "VANTAGE_JA3")]
    ja3: bool,

    /// Forge the HTTP/2 SETTINGS fingerprint on origin connections
    #[arg(long, env = "VANTAGE_H2_JA3")]
    h2_ja3: bool,

    /// Log every intercepted request and response
    #[arg(short, long, env = "VANTAGE_DEBUG")]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "VANTAGE_LOG_LEVEL")]
    log_level: String,

    /// Enable JSON structured logging
    #[arg(long, env = "VANTAGE_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls ring crypto provider (required for rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting vantage");

    let config = load_config(&cli)?;
    let callbacks = build_callbacks(&cli);

    let server = ProxyServer::bind(config, callbacks)
        .await
        .context("Failed to start proxy")?;
    tracing::info!(addr = %server.local_addr(), "Proxy listening");

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
            handle.close();
        }
    });

    server.run().await?;
    tracing::info!("Proxy shut down");
    Ok(())
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);
    if cli.log_json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(user) = &cli.user {
        config.auth.user = Some(user.clone());
    }
    if let Some(password) = &cli.password {
        config.auth.password = Some(password.clone());
    }
    if let Some(upstream) = &cli.upstream {
        config.upstream.proxy = Some(upstream.clone());
    }
    if cli.ja3 {
        config.fingerprint.ja3 = true;
    }
    if cli.h2_ja3 {
        config.fingerprint.h2_ja3 = true;
    }

    Ok(config)
}

/// Build traffic-logging callbacks when --debug is set
fn build_callbacks(cli: &Cli) -> Callbacks {
    let mut callbacks = Callbacks::default();
    if cli.debug {
        callbacks.request = Some(Arc::new(|req| {
            tracing::info!(method = %req.method, host = %req.authority(), path = %req.path(), "request");
            Ok(())
        }));
        callbacks.response = Some(Arc::new(|req, resp| {
            tracing::info!(
                method = %req.method,
                host = %req.authority(),
                status = resp.status.as_u16(),
                bytes = resp.body.len(),
                "response"
            );
            Ok(())
        }));
    }
    callbacks
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}
