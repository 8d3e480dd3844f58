//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! CLI flags / config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → shared with the server at construction
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults so a bare `chocon` invocation works
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::{ClientConfig, ProxyConfig, StatsConfig, TimeoutConfig};
