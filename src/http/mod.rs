//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (router, middleware, serve loop)
//!     → /.api/* handlers, or proxy::handler for everything else
//!     → client.rs (shared upstream client, per-host ceiling)
//! ```

pub mod client;
pub mod server;

pub use server::HttpServer;
