//! Host-based proxying.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → handler.rs (loop check, request id, outbound copy)
//!     → host.rs (Host suffix decode)  |  upstream::acquire (fixed mode)
//!     → shared client dispatch
//!     → response relay (streamed body)
//! ```

pub mod handler;
pub mod host;

pub use handler::{proxy, PROXY_ID_HEADER, PROXY_VER_HEADER};
