//! Host header suffix decoding.
//!
//! The backend is encoded in the Host header as
//! `<backend>.<marker>[.<zone>…][:port]`. The marker may be followed by
//! arbitrary zone labels, so the scan keeps the *last* marker occurrence and
//! strips everything from it onward; the labels before it are the real host.

use http::uri::Scheme;

const MARKERS: [&str; 4] = [
    "ccnproxy",
    "ccnproxy-https",
    "ccnproxy-ssl",
    "ccnproxy-secure",
];

/// A decoded proxy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTarget {
    /// Rewritten authority, `host[:port]`.
    pub authority: String,
    /// `https` for the secure marker aliases, `http` otherwise.
    pub scheme: Scheme,
}

/// Decode a Host header value into a proxy target.
///
/// Returns `None` when the host is empty or carries no marker label with at
/// least one label before it; callers answer such requests with 400.
pub fn rewrite_host(host: &str) -> Option<HostTarget> {
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };

    let labels: Vec<&str> = name.split('.').collect();
    let mut marker = 0;
    for (i, label) in labels.iter().enumerate() {
        if MARKERS.contains(label) {
            marker = i;
        }
    }
    if marker == 0 {
        return None;
    }

    let mut authority = labels[..marker].join(".");
    if let Some(port) = port {
        authority.push(':');
        authority.push_str(port);
    }

    let scheme = if labels[marker] == "ccnproxy" {
        Scheme::HTTP
    } else {
        Scheme::HTTPS
    };

    Some(HostTarget { authority, scheme })
}
