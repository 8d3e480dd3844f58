//! Request metrics: per-status counters and a sampled response-time ring.
//!
//! Counters are plain atomics so the hot path stays lock-free. Response
//! times go through a mutex-guarded ring buffer; with a sampling factor
//! greater than 1 only every 1/factor-th request takes the lock, which keeps
//! contention bounded under load while the counters stay exact.

pub mod runtime;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use rand::Rng;
use serde::Serialize;
use thiserror::Error;

/// Default response-time ring size.
pub const DEFAULT_BUFFER_SIZE: usize = 1000;
/// Default sampling factor.
pub const DEFAULT_SAMPLING_FACTOR: u32 = 1;

/// Statuses reported individually in the snapshot. Everything else still
/// counts toward the total.
const TRACKED_STATUSES: [u16; 10] = [200, 400, 401, 403, 404, 500, 501, 502, 503, 504];

/// Status codes are at most three digits; larger values are ignored.
const STATUS_SLOTS: usize = 1000;

const PERCENTILES: [u8; 3] = [90, 95, 99];

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("bufsize must be greater than or equal to 2")]
    BufferTooSmall,
    #[error("factor must be greater than 0")]
    FactorTooSmall,
}

/// HTTP request metrics for a single handler.
pub struct Metrics {
    count: AtomicU64,
    status_count: Vec<AtomicU64>,
    ring: Mutex<Ring>,
    factor: u32,
}

struct Ring {
    samples: Vec<f64>,
    cursor: usize,
}

impl Ring {
    fn insert(&mut self, t: f64) {
        self.samples[self.cursor] = t;
        self.cursor = (self.cursor + 1) % self.samples.len();
    }
}

impl Metrics {
    pub fn new() -> Self {
        match Self::with_capacity(DEFAULT_BUFFER_SIZE, DEFAULT_SAMPLING_FACTOR) {
            Ok(metrics) => metrics,
            Err(_) => unreachable!("default capacity is valid"),
        }
    }

    /// Create a metrics structure with a response-time ring of `bufsize`
    /// entries, sampled at one in `factor` requests.
    pub fn with_capacity(bufsize: usize, factor: u32) -> Result<Self, StatsError> {
        if bufsize < 2 {
            return Err(StatsError::BufferTooSmall);
        }
        if factor < 1 {
            return Err(StatsError::FactorTooSmall);
        }

        let mut status_count = Vec::with_capacity(STATUS_SLOTS);
        status_count.resize_with(STATUS_SLOTS, || AtomicU64::new(0));

        Ok(Self {
            count: AtomicU64::new(0),
            status_count,
            ring: Mutex::new(Ring {
                samples: vec![0.0; bufsize],
                cursor: 0,
            }),
            factor,
        })
    }

    /// Record one completed request: `status` and elapsed seconds.
    pub fn record(&self, status: u16, elapsed_secs: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = self.status_count.get(status as usize) {
            slot.fetch_add(1, Ordering::Relaxed);
        }

        if self.factor == 1 || rand::thread_rng().gen_range(0..self.factor) == 0 {
            self.lock_ring().insert(elapsed_secs);
        }
    }

    /// Produce a point-in-time snapshot of counters and response times.
    pub fn snapshot(&self) -> Snapshot {
        let ring = self.lock_ring();
        let bufsize = ring.samples.len();

        let mut total = 0.0;
        let mut max_time = 0.0f64;
        let mut min_time = f64::MAX;
        for &t in &ring.samples {
            total += t;
            if t < min_time {
                min_time = t;
            }
            if t > max_time {
                max_time = t;
            }
        }

        let mut sorted = ring.samples.clone();
        drop(ring);
        sorted.sort_unstable_by(f64::total_cmp);

        let mut percentiled_time = BTreeMap::new();
        for p in PERCENTILES {
            percentiled_time.insert(p, nearest_rank(&sorted, p));
        }

        let mut status_count = BTreeMap::new();
        for status in TRACKED_STATUSES {
            let n = self.status_count[status as usize].load(Ordering::Relaxed);
            status_count.insert(status, n);
        }

        Snapshot {
            request: RequestData {
                count: self.count.load(Ordering::Relaxed),
                status_count,
            },
            response: ResponseData {
                max_time,
                min_time,
                average_time: total / bufsize as f64,
                percentiled_time,
            },
        }
    }

    fn lock_ring(&self) -> MutexGuard<'_, Ring> {
        match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn nearest_rank(sorted: &[f64], percent: u8) -> f64 {
    let rank = ((percent as f64 / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Metrics of HTTP requests.
#[derive(Debug, Serialize)]
pub struct RequestData {
    /// Sum of all HTTP request counts.
    pub count: u64,

    /// HTTP request count for each tracked HTTP status.
    pub status_count: BTreeMap<u16, u64>,
}

/// Metrics of HTTP responses.
#[derive(Debug, Serialize)]
pub struct ResponseData {
    /// Maximum response time in the ring, in seconds.
    pub max_time: f64,

    /// Minimum response time in the ring, in seconds.
    pub min_time: f64,

    /// Average response time over the whole ring; slots not yet written
    /// contribute 0.0.
    pub average_time: f64,

    /// Response-time percentiles over the ring.
    pub percentiled_time: BTreeMap<u8, f64>,
}

/// A point-in-time metrics snapshot.
#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub request: RequestData,
    pub response: ResponseData,
}
