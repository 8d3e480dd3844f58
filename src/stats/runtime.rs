//! Runtime process statistics.

use std::time::Instant;

use serde::Serialize;

/// A snapshot of process-level runtime statistics.
#[derive(Debug, Serialize)]
pub struct RuntimeStats {
    pub version: String,
    pub pid: u32,
    pub uptime_secs: u64,
}

impl RuntimeStats {
    pub fn collect(version: &str, started_at: Instant) -> Self {
        Self {
            version: version.to_string(),
            pid: std::process::id(),
            uptime_secs: started_at.elapsed().as_secs(),
        }
    }
}
