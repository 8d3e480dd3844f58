//! chocon: host-header driven HTTP reverse proxy.
//!
//! ```text
//!                  ┌───────────────────────────────────────────────┐
//!   Client ───────▶│  server → proxy handler ─┬─ Host suffix decode │
//!                  │                          └─ fixed upstream     │
//!                  │        metrics sampler ◀─ every response       │
//!                  └──────────────┬────────────────────────────────┘
//!                                 ▼
//!                             Backend(s)
//! ```
//!
//! Backends are addressed through the Host header
//! (`backend.example.com.ccnproxy[:port]`, TLS via the `-https`/`-ssl`/
//! `-secure` marker aliases), or through a fixed upstream whose hostname is
//! re-resolved every few seconds and load-balanced least-busy first.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use chocon::config::loader::load_config;
use chocon::config::validation::validate_config;
use chocon::lifecycle::{self, Shutdown};
use chocon::upstream::Upstream;
use chocon::{HttpServer, ProxyConfig};

#[derive(Parser)]
#[command(name = "chocon", about = "host-based proxy server", version)]
struct Args {
    /// Path to a TOML configuration file. Flags override file values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind (e.g. 0.0.0.0:3000).
    #[arg(short, long)]
    listen: Option<String>,

    /// Fixed upstream URL, http(s)://host[:port]. Disables Host decoding.
    #[arg(short, long)]
    upstream: Option<String>,

    /// Inbound read timeout in seconds.
    #[arg(long)]
    read_timeout: Option<u64>,

    /// Per-request deadline in seconds.
    #[arg(long)]
    write_timeout: Option<u64>,

    /// Backend response-header timeout in seconds.
    #[arg(long)]
    proxy_read_timeout: Option<u64>,

    /// Maximum in-flight requests per backend host (0 = unlimited).
    #[arg(long)]
    max_conns_per_host: Option<usize>,

    /// Maximum idle keep-alive connections per backend.
    #[arg(long)]
    keepalive_conns: Option<usize>,

    /// Graceful-shutdown deadline in seconds.
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Response-time ring buffer size (>= 2).
    #[arg(long)]
    stats_bufsize: Option<usize>,

    /// Response-time sampling factor (>= 1).
    #[arg(long)]
    stats_spfactor: Option<u32>,

    /// Skip backend TLS certificate verification. Debug only.
    #[arg(long)]
    insecure: bool,
}

impl Args {
    fn into_config(self) -> Result<ProxyConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(upstream) = self.upstream {
            config.upstream = upstream;
        }
        if let Some(secs) = self.read_timeout {
            config.timeouts.read_secs = secs;
        }
        if let Some(secs) = self.write_timeout {
            config.timeouts.write_secs = secs;
        }
        if let Some(secs) = self.proxy_read_timeout {
            config.timeouts.proxy_read_secs = secs;
        }
        if let Some(max) = self.max_conns_per_host {
            config.client.max_conns_per_host = max;
        }
        if let Some(max) = self.keepalive_conns {
            config.client.keepalive_conns = max;
        }
        if let Some(secs) = self.shutdown_timeout {
            config.timeouts.shutdown_secs = secs;
        }
        if let Some(bufsize) = self.stats_bufsize {
            config.stats.bufsize = bufsize;
        }
        if let Some(factor) = self.stats_spfactor {
            config.stats.spfactor = factor;
        }
        if self.insecure {
            config.client.insecure = true;
        }

        if let Err(errors) = validate_config(&config) {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(joined.into());
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    chocon::observability::logging::init("chocon=info,tower_http=warn");

    let config = Args::parse().into_config()?;

    tracing::info!(
        listen = %config.listen,
        upstream = %config.upstream,
        version = %config.version,
        "chocon starting"
    );

    let upstream = if config.upstream.is_empty() {
        None
    } else {
        let upstream = Arc::new(Upstream::parse(&config.upstream)?);
        upstream.init().await?;
        tracing::info!(host = %upstream.host(), "fixed upstream resolved");
        Some(upstream)
    };

    let shutdown = Arc::new(Shutdown::new());
    lifecycle::spawn_signal_listener(shutdown.clone());
    if let Some(upstream) = &upstream {
        upstream.clone().spawn_refresh(shutdown.subscribe());
    }

    let listener = TcpListener::bind(&config.listen).await?;
    let server = HttpServer::new(&config, upstream)?;
    server.run(listener, shutdown).await?;

    tracing::info!("shutdown complete");
    Ok(())
}
