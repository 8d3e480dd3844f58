//! Observability subsystem.
//!
//! # Design Decisions
//! - Structured logging via `tracing`; every proxy error path carries the
//!   request host, target host, scheme and request id as fields
//! - Request metrics are cheap (atomic increments) and live in `stats`

pub mod logging;
