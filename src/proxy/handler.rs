//! The proxy handler: loop detection, request id, routing, dispatch, relay.

use std::str::FromStr;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use futures_util::StreamExt;
use http::header::{self, HeaderName, HeaderValue};
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{StatusCode, Uri, Version};
use http_body_util::BodyExt;
use uuid::Uuid;

use crate::http::server::AppState;
use crate::proxy::host::rewrite_host;
use crate::upstream::AddressGuard;

/// Request identifier, echoed on every response.
pub const PROXY_ID_HEADER: &str = "x-chocon-id";
/// Loop-detection marker. Present on an inbound request means the request
/// already went through a proxy instance.
pub const PROXY_VER_HEADER: &str = "x-chocon-ver";

/// Headers never copied from the inbound request to the outbound one.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Proxy one request end to end.
pub async fn proxy(State(state): State<AppState>, request: Request) -> Response {
    let (proxy_id, id_value) = request_id(&request);

    if request.headers().contains_key(PROXY_VER_HEADER) {
        return respond(StatusCode::LOOP_DETECTED, Body::empty(), &id_value);
    }

    let request_host = inbound_host(&request);
    let (parts, body) = request.into_parts();

    // Routing: fixed upstream when configured, Host suffix decoding
    // otherwise.
    let mut guard: Option<AddressGuard> = None;
    let mut inject_version = false;
    let (scheme, authority, host_header) = match &state.upstream {
        Some(upstream) => match upstream.acquire() {
            Ok(lease) => {
                let authority = lease.authority().to_string();
                guard = Some(lease);
                // The backend still sees the client-supplied virtual host.
                (upstream.scheme(), authority, request_host.clone())
            }
            Err(err) => {
                tracing::error!(
                    request_host = %request_host,
                    request_path = %parts.uri.path(),
                    proxy_id = %proxy_id,
                    error = %err,
                    "no upstream address available"
                );
                return respond(StatusCode::BAD_GATEWAY, Body::empty(), &id_value);
            }
        },
        None => match rewrite_host(&request_host) {
            Some(target) => {
                inject_version = true;
                (target.scheme, target.authority.clone(), target.authority)
            }
            None => {
                tracing::warn!(
                    request_host = %request_host,
                    request_path = %parts.uri.path(),
                    proxy_id = %proxy_id,
                    "no proxy marker in request host"
                );
                return respond(StatusCode::BAD_REQUEST, Body::empty(), &id_value);
            }
        },
    };

    let outbound = match copy_request(&parts, body, scheme.clone(), &authority, &host_header) {
        Ok(mut outbound) => {
            outbound
                .headers_mut()
                .insert(PROXY_ID_HEADER, id_value.clone());
            if inject_version {
                outbound
                    .headers_mut()
                    .insert(PROXY_VER_HEADER, state.version_header.clone());
            }
            outbound
        }
        Err(err) => {
            tracing::error!(
                request_host = %request_host,
                request_path = %parts.uri.path(),
                proxy_host = %authority,
                proxy_scheme = %scheme,
                proxy_id = %proxy_id,
                error = %err,
                "failed to build outbound request"
            );
            let status = if state.upstream.is_some() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::BAD_REQUEST
            };
            return respond(status, Body::empty(), &id_value);
        }
    };

    let permit = state.limiter.acquire(&authority).await;

    let response = match tokio::time::timeout(
        state.proxy_read_timeout,
        state.client.request(outbound),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            let status = classify_dispatch_error(&err);
            tracing::error!(
                request_host = %request_host,
                request_path = %parts.uri.path(),
                proxy_host = %authority,
                proxy_scheme = %scheme,
                proxy_id = %proxy_id,
                error = %err,
                "proxy request failed"
            );
            let body = if status == client_closed_request() {
                Body::from("client closed request")
            } else {
                Body::empty()
            };
            return respond(status, body, &id_value);
        }
        Err(_) => {
            tracing::error!(
                request_host = %request_host,
                request_path = %parts.uri.path(),
                proxy_host = %authority,
                proxy_scheme = %scheme,
                proxy_id = %proxy_id,
                "proxy request timed out waiting for response headers"
            );
            return respond(StatusCode::GATEWAY_TIMEOUT, Body::empty(), &id_value);
        }
    };

    // Relay: the handler's own id wins, and the backend's marker header
    // never reaches the client.
    let (mut parts, backend_body) = response.into_parts();
    parts.headers.remove(PROXY_ID_HEADER);
    parts.headers.remove(PROXY_VER_HEADER);
    parts.headers.insert(PROXY_ID_HEADER, id_value);

    // The lease and the dispatch permit stay held until the body has been
    // streamed through.
    let body = backend_body.into_data_stream().map(move |chunk| {
        let _held = (&guard, &permit);
        chunk
    });

    Response::from_parts(parts, Body::from_stream(body))
}

/// Inbound id when present, otherwise a freshly minted one.
fn request_id(request: &Request) -> (String, HeaderValue) {
    if let Some(value) = request.headers().get(PROXY_ID_HEADER) {
        if let Ok(id) = value.to_str() {
            return (id.to_string(), value.clone());
        }
    }
    let id = Uuid::new_v4().simple().to_string();
    let value = HeaderValue::from_str(&id).expect("generated id is a valid header value");
    (id, value)
}

fn inbound_host(request: &Request) -> String {
    request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Copy the inbound request into an outbound one: same method, path and
/// query, streamed body; HTTP/1.1; hop-by-hop headers dropped; Host set to
/// the routed authority.
fn copy_request(
    parts: &http::request::Parts,
    body: Body,
    scheme: Scheme,
    authority: &str,
    host_header: &str,
) -> Result<Request, http::Error> {
    let mut uri_parts = http::uri::Parts::default();
    uri_parts.scheme = Some(scheme);
    uri_parts.authority = Some(Authority::from_str(authority)?);
    uri_parts.path_and_query = Some(match parts.uri.path_and_query() {
        Some(path_and_query) => path_and_query.clone(),
        None => PathAndQuery::from_static("/"),
    });
    let uri = Uri::from_parts(uri_parts)?;

    let mut outbound = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .version(Version::HTTP_11)
        .body(body)?;

    let headers = outbound.headers_mut();
    for (name, value) in parts.headers.iter() {
        if name == header::HOST || is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(header::HOST, HeaderValue::from_str(host_header)?);

    Ok(outbound)
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

fn respond(status: StatusCode, body: Body, id_value: &HeaderValue) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(PROXY_ID_HEADER, id_value.clone());
    response
}

/// 499 is not in the standard registry but is widely understood as "client
/// closed request"; it keeps client disconnects distinguishable from real
/// backend failures in access logs.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).expect("499 is a valid status code")
}

/// Map a transport error onto the status reported to the client: timeouts
/// become 504, a vanished client becomes 499, anything else 502.
fn classify_dispatch_error(err: &hyper_util::client::legacy::Error) -> StatusCode {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(hyper_err) = current.downcast_ref::<hyper::Error>() {
            if hyper_err.is_timeout() {
                return StatusCode::GATEWAY_TIMEOUT;
            }
            if hyper_err.is_canceled() || hyper_err.is_incomplete_message() {
                return client_closed_request();
            }
        }
        if let Some(io_err) = current.downcast_ref::<std::io::Error>() {
            match io_err.kind() {
                std::io::ErrorKind::TimedOut => return StatusCode::GATEWAY_TIMEOUT,
                std::io::ErrorKind::UnexpectedEof => return client_closed_request(),
                _ => {}
            }
        }
        source = current.source();
    }
    StatusCode::BAD_GATEWAY
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn inbound(uri: &str) -> Request {
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        request
            .headers_mut()
            .insert("connection", HeaderValue::from_static("keep-alive"));
        request
            .headers_mut()
            .insert("upgrade", HeaderValue::from_static("websocket"));
        request
            .headers_mut()
            .insert("transfer-encoding", HeaderValue::from_static("chunked"));
        request
            .headers_mut()
            .insert("some-key", HeaderValue::from_static("some-value"));
        request
            .headers_mut()
            .append("accept", HeaderValue::from_static("text/plain"));
        request
            .headers_mut()
            .append("accept", HeaderValue::from_static("application/json"));
        request
    }

    #[test]
    fn test_copy_request_strips_hop_by_hop() {
        let request = inbound("/some-path?a=foo");
        let (parts, body) = request.into_parts();

        let outbound =
            copy_request(&parts, body, Scheme::HTTP, "example.com:3000", "example.com:3000")
                .unwrap();

        assert_eq!(outbound.version(), Version::HTTP_11);
        assert_eq!(outbound.uri().to_string(), "http://example.com:3000/some-path?a=foo");
        assert_eq!(outbound.headers().get("host").unwrap(), "example.com:3000");
        assert_eq!(outbound.headers().get("some-key").unwrap(), "some-value");
        assert!(outbound.headers().get("connection").is_none());
        assert!(outbound.headers().get("upgrade").is_none());
        assert!(outbound.headers().get("transfer-encoding").is_none());
    }

    #[test]
    fn test_copy_request_preserves_multi_valued_headers() {
        let request = inbound("/");
        let (parts, body) = request.into_parts();

        let outbound = copy_request(&parts, body, Scheme::HTTP, "example.com", "example.com").unwrap();

        let accepts: Vec<_> = outbound
            .headers()
            .get_all("accept")
            .iter()
            .map(|value| value.to_str().unwrap())
            .collect();
        assert_eq!(accepts, ["text/plain", "application/json"]);
    }

    #[test]
    fn test_request_id_echoes_inbound() {
        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        request
            .headers_mut()
            .insert(PROXY_ID_HEADER, HeaderValue::from_static("abc123"));

        let (id, value) = request_id(&request);
        assert_eq!(id, "abc123");
        assert_eq!(value, "abc123");
    }

    #[test]
    fn test_request_id_mints_when_absent() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let (id, _) = request_id(&request);
        assert!(!id.is_empty());

        let (other, _) = request_id(&request);
        assert_ne!(id, other);
    }
}
