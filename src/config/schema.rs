//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address (e.g., "0.0.0.0:3000"). Used by `main`; the server
    /// itself accepts a pre-bound listener.
    pub listen: String,

    /// Fixed upstream URL (`http(s)://host[:port]`). Empty disables fixed
    /// upstream mode and routing falls back to Host-header decoding.
    pub upstream: String,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Upstream HTTP client configuration.
    pub client: ClientConfig,

    /// Request metrics configuration.
    pub stats: StatsConfig,

    /// Version string emitted in the proxy marker header.
    pub version: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            upstream: String::new(),
            timeouts: TimeoutConfig::default(),
            client: ClientConfig::default(),
            stats: StatsConfig::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Inbound read bound in seconds.
    pub read_secs: u64,

    /// Server-side per-request deadline in seconds.
    pub write_secs: u64,

    /// Backend response-header timeout in seconds.
    pub proxy_read_secs: u64,

    /// Graceful-shutdown deadline in seconds.
    pub shutdown_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 30,
            write_secs: 90,
            proxy_read_secs: 60,
            shutdown_secs: 3600,
        }
    }
}

/// Upstream HTTP client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum in-flight requests per backend authority (0 = unlimited).
    pub max_conns_per_host: usize,

    /// Maximum idle keep-alive connections per backend.
    pub keepalive_conns: usize,

    /// Skip backend TLS certificate verification. Debug only.
    pub insecure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 0,
            keepalive_conns: 2,
            insecure: false,
        }
    }
}

/// Request metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Response-time ring buffer size. Must be at least 2.
    pub bufsize: usize,

    /// Sampling factor: a response time is recorded with probability
    /// 1/spfactor. Must be at least 1.
    pub spfactor: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            bufsize: 1000,
            spfactor: 1,
        }
    }
}
