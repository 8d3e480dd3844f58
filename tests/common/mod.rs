//! Shared utilities for integration testing.
//!
//! Backends are plain TCP servers that parse one HTTP/1.1 request and echo
//! what they observed as JSON, so tests can assert on exactly what crossed
//! the wire. The raw client exists because the proxy routes on the literal
//! `Host` header value, which high-level clients do not let tests control.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use chocon::upstream::Upstream;
use chocon::{HttpServer, ProxyConfig, Shutdown};

/// A mock backend that answers every request with `status` and a JSON body
/// describing the request it saw.
pub struct EchoBackend {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
}

impl EchoBackend {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

pub async fn spawn_echo_backend(status: u16) -> EchoBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let task_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let hits = task_hits.clone();
                    tokio::spawn(async move {
                        echo_connection(socket, status, hits).await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    EchoBackend { addr, hits }
}

/// A backend that accepts connections but never responds; used to provoke
/// response-header timeouts.
pub async fn spawn_black_hole_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut sink = [0u8; 1024];
                        while let Ok(n) = socket.read(&mut sink).await {
                            if n == 0 {
                                break;
                            }
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

async fn echo_connection(mut socket: TcpStream, status: u16, hits: Arc<AtomicUsize>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
            break pos;
        }
        match socket.read(&mut tmp).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&tmp[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut pieces = request_line.split(' ');
    let method = pieces.next().unwrap_or_default().to_string();
    let target = pieces.next().unwrap_or_default().to_string();
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target, String::new()),
    };

    let mut headers = serde_json::Map::new();
    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().unwrap_or(0);
            }
            headers.insert(name, serde_json::Value::String(value));
        }
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        match socket.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => body.extend_from_slice(&tmp[..n]),
        }
    }

    hits.fetch_add(1, Ordering::SeqCst);

    let payload = serde_json::json!({
        "method": method,
        "path": path,
        "query": query,
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
    })
    .to_string();

    let reason = match status {
        200 => "OK",
        201 => "Created",
        500 => "Internal Server Error",
        _ => "OK",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         some-key: some-value\r\n\
         x-chocon-id: backend-id\r\n\
         x-chocon-ver: backend-ver\r\n\
         Connection: close\r\n\r\n{payload}",
        payload.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Start a proxy on an ephemeral port and return its address.
pub async fn spawn_proxy(config: ProxyConfig, upstream: Option<Arc<Upstream>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(&config, upstream).unwrap();
    let shutdown = Arc::new(Shutdown::new());

    tokio::spawn(async move {
        let _ = server.run(listener, shutdown).await;
    });

    addr
}

/// A parsed raw HTTP response.
pub struct RawResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body should be JSON")
    }
}

/// Write a raw request and read the whole response. The request must carry
/// `Connection: close` so the read terminates at EOF.
pub async fn send_raw(addr: SocketAddr, request: &str) -> RawResponse {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    socket.read_to_end(&mut buf).await.unwrap();

    let header_end = find_subsequence(&buf, b"\r\n\r\n").expect("malformed response head");
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("malformed status line");

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let raw_body = &buf[header_end + 4..];
    let body = if headers
        .get("transfer-encoding")
        .is_some_and(|te| te.contains("chunked"))
    {
        decode_chunked(raw_body)
    } else {
        raw_body.to_vec()
    };

    RawResponse {
        status,
        headers,
        body,
    }
}

fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let Some(line_end) = find_subsequence(raw, b"\r\n") else {
            break;
        };
        let size_line = String::from_utf8_lossy(&raw[..line_end]);
        let Ok(size) = usize::from_str_radix(size_line.trim(), 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        if raw.len() < start + size + 2 {
            break;
        }
        body.extend_from_slice(&raw[start..start + size]);
        raw = &raw[start + size + 2..];
    }
    body
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
