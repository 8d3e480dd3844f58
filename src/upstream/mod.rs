//! Fixed upstream: periodic DNS resolution and least-busy address selection.
//!
//! # Data Flow
//! ```text
//! upstream URL → parse (scheme, host, port)
//!     → initial lookup (startup fails if it yields nothing)
//!     → background refresh every REFRESH_INTERVAL
//!         → sorted IPs → checksum → swap address set only on change
//! acquire() → least in-flight, random tie-break → AddressGuard
//! drop(AddressGuard) → release, matched on (ip, version)
//! ```
//!
//! Address records carry the resolver version current at insertion time so
//! a release that outlives a refresh-induced replacement is a no-op instead
//! of corrupting an unrelated record with the same IP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use http::uri::Scheme;
use http::Uri;
use rand::Rng;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Interval between background lookups.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3);
/// Deadline for a single lookup.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream url is invalid: {0}")]
    InvalidUrl(String),

    #[error("upstream url is invalid: scheme should be http or https")]
    InvalidScheme,

    #[error("upstream url is invalid: no hostname")]
    NoHostname,

    #[error("could not resolve hostname {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("no upstream hosts")]
    NoAddresses,
}

/// One resolved address with its in-flight counter.
#[derive(Debug)]
struct Address {
    ip: String,
    version: u64,
    in_flight: i64,
}

#[derive(Debug, Default)]
struct AddressSet {
    records: Vec<Address>,
    checksum: String,
}

/// A fixed upstream host, kept fresh by a background resolver task.
#[derive(Debug)]
pub struct Upstream {
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    version: AtomicU64,
    addresses: Mutex<AddressSet>,
}

impl Upstream {
    /// Parse an upstream URL. No lookup happens here; call [`Upstream::init`]
    /// before serving.
    pub fn parse(upstream: &str) -> Result<Self, UpstreamError> {
        let uri: Uri = upstream
            .parse()
            .map_err(|err: http::uri::InvalidUri| UpstreamError::InvalidUrl(err.to_string()))?;

        let scheme = match uri.scheme() {
            Some(s) if *s == Scheme::HTTP || *s == Scheme::HTTPS => s.clone(),
            _ => return Err(UpstreamError::InvalidScheme),
        };
        let host = match uri.host() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(UpstreamError::NoHostname),
        };

        Ok(Self {
            scheme,
            host,
            port: uri.port_u16(),
            version: AtomicU64::new(0),
            addresses: Mutex::new(AddressSet::default()),
        })
    }

    /// Perform the initial lookup. Fails when the host does not resolve to
    /// at least one address.
    pub async fn init(&self) -> Result<(), UpstreamError> {
        self.refresh().await
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme.clone()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolve the host once and swap in the result if it changed.
    async fn refresh(&self) -> Result<(), UpstreamError> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let ips = self.resolve().await?;
        if ips.is_empty() {
            return Err(UpstreamError::NoAddresses);
        }
        self.apply(version, ips);
        Ok(())
    }

    async fn resolve(&self) -> Result<Vec<String>, UpstreamError> {
        let port = self.port.unwrap_or(if self.scheme == Scheme::HTTPS {
            443
        } else {
            80
        });

        let addrs = tokio::time::timeout(
            LOOKUP_TIMEOUT,
            tokio::net::lookup_host((self.host.as_str(), port)),
        )
        .await
        .map_err(|_| UpstreamError::Resolve {
            host: self.host.clone(),
            reason: "lookup timed out".to_string(),
        })?
        .map_err(|err| UpstreamError::Resolve {
            host: self.host.clone(),
            reason: err.to_string(),
        })?;

        let mut ips: Vec<String> = addrs.map(|addr| addr.ip().to_string()).collect();
        ips.sort_unstable();
        ips.dedup();
        Ok(ips)
    }

    /// Install a resolved address list stamped with `version`. The swap is
    /// skipped when the sorted-joined checksum matches the current set, so
    /// in-flight counters survive refreshes that change nothing.
    fn apply(&self, version: u64, ips: Vec<String>) {
        let checksum = ips.join(",");
        let mut set = self.lock_addresses();
        if set.checksum == checksum {
            return;
        }
        set.records = ips
            .into_iter()
            .map(|ip| Address {
                ip,
                version,
                in_flight: 0,
            })
            .collect();
        set.checksum = checksum;
    }

    /// Pick the least-busy address, breaking ties uniformly at random.
    /// Returns the authority to dial and a guard that releases the slot on
    /// drop.
    pub fn acquire(self: &Arc<Self>) -> Result<AddressGuard, UpstreamError> {
        let mut set = self.lock_addresses();
        if set.records.is_empty() {
            return Err(UpstreamError::NoAddresses);
        }

        let min = set
            .records
            .iter()
            .map(|r| r.in_flight)
            .min()
            .unwrap_or_default();
        let candidates: Vec<usize> = set
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.in_flight == min)
            .map(|(i, _)| i)
            .collect();
        let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];

        let record = &mut set.records[pick];
        record.in_flight += 1;

        let authority = match self.port {
            Some(port) => format!("{}:{}", record.ip, port),
            None => record.ip.clone(),
        };

        Ok(AddressGuard {
            upstream: Arc::clone(self),
            ip: record.ip.clone(),
            version: record.version,
            authority,
        })
    }

    fn release(&self, ip: &str, version: u64) {
        let mut set = self.lock_addresses();
        for record in &mut set.records {
            if record.ip == ip && record.version == version {
                record.in_flight -= 1;
            }
        }
    }

    fn lock_addresses(&self) -> MutexGuard<'_, AddressSet> {
        match self.addresses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run the refresh loop until shutdown. Lookup failures keep the
    /// previous address set serving.
    pub fn spawn_refresh(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh().await {
                            tracing::error!(host = %self.host, error = %err, "failed to refresh upstream addresses");
                        }
                    }
                }
            }
        })
    }

    #[cfg(test)]
    fn in_flight_counts(&self) -> Vec<i64> {
        self.lock_addresses()
            .records
            .iter()
            .map(|r| r.in_flight)
            .collect()
    }
}

/// A leased upstream address. Dropping the guard releases the in-flight
/// slot; a drop that happens after the record was replaced by a refresh is
/// a no-op thanks to the version stamp.
#[derive(Debug)]
pub struct AddressGuard {
    upstream: Arc<Upstream>,
    ip: String,
    version: u64,
    authority: String,
}

impl AddressGuard {
    /// `ip[:port]` to dial, with the configured upstream port when present.
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

impl Drop for AddressGuard {
    fn drop(&mut self) {
        self.upstream.release(&self.ip, self.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(url: &str) -> Arc<Upstream> {
        Arc::new(Upstream::parse(url).unwrap())
    }

    #[test]
    fn test_parse_rejects_bad_urls() {
        assert!(matches!(
            Upstream::parse("ftp://example.com"),
            Err(UpstreamError::InvalidScheme)
        ));
        assert!(matches!(
            Upstream::parse("/no-scheme"),
            Err(UpstreamError::InvalidScheme)
        ));
        assert!(Upstream::parse("http://example.com:8080").is_ok());
    }

    #[test]
    fn test_acquire_on_empty_set_fails() {
        let upstream = upstream("http://backend.test");
        assert!(matches!(
            upstream.acquire(),
            Err(UpstreamError::NoAddresses)
        ));
    }

    #[test]
    fn test_acquire_appends_configured_port() {
        let upstream = upstream("http://backend.test:8080");
        upstream.apply(1, vec!["10.0.0.1".to_string()]);

        let guard = upstream.acquire().unwrap();
        assert_eq!(guard.authority(), "10.0.0.1:8080");
    }

    #[test]
    fn test_least_busy_selection_balances_held_leases() {
        let upstream = upstream("http://backend.test");
        upstream.apply(1, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);

        let mut guards = Vec::new();
        for _ in 0..100 {
            guards.push(upstream.acquire().unwrap());
        }

        // Held leases force strict alternation: both records end up with
        // exactly half the load.
        assert_eq!(upstream.in_flight_counts(), vec![50, 50]);

        drop(guards);
        assert_eq!(upstream.in_flight_counts(), vec![0, 0]);
    }

    #[test]
    fn test_release_after_replacement_is_noop() {
        let upstream = upstream("http://backend.test");
        upstream.apply(1, vec!["10.0.0.1".to_string()]);

        let guard = upstream.acquire().unwrap();
        assert_eq!(upstream.in_flight_counts(), vec![1]);

        // A refresh that changes the set replaces the record; the old lease
        // must not touch the new record's counter.
        upstream.apply(2, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        drop(guard);
        assert_eq!(upstream.in_flight_counts(), vec![0, 0]);
    }

    #[test]
    fn test_identical_refresh_preserves_counters() {
        let upstream = upstream("http://backend.test");
        let ips = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        upstream.apply(1, ips.clone());

        let _guard = upstream.acquire().unwrap();
        let before: i64 = upstream.in_flight_counts().iter().sum();
        assert_eq!(before, 1);

        upstream.apply(2, ips);
        let after: i64 = upstream.in_flight_counts().iter().sum();
        assert_eq!(after, 1);
    }

    #[tokio::test]
    async fn test_init_resolves_literal_address() {
        let upstream = upstream("http://127.0.0.1:9999");
        upstream.init().await.unwrap();

        let guard = upstream.acquire().unwrap();
        assert_eq!(guard.authority(), "127.0.0.1:9999");
    }
}
