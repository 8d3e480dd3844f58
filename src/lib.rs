//! Host-header driven HTTP reverse proxy.
//!
//! Requests carry their destination in the `Host` header using a marker
//! suffix (`backend.example.com.ccnproxy[:port]`); the proxy decodes the
//! suffix, rewrites the request and forwards it, optionally over TLS. With a
//! fixed upstream configured, the upstream hostname is resolved periodically
//! and requests are spread across the resolved addresses, least-busy first.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod stats;
pub mod upstream;

pub use config::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
