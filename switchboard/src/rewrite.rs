//! URL, path, and header rewriting shared by the HTTP dispatcher and the
//! WebSocket bridge. Everything here is a pure function of its inputs.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use thiserror::Error;
use url::Url;

/// Handshake headers that must be regenerated by the transport opening the
/// upstream connection, never forwarded verbatim.
const EXCLUDED_WEBSOCKET_HEADERS: [&str; 5] = [
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("URL is required")]
    Empty,

    #[error("invalid URL")]
    Malformed,

    #[error("only http and https URLs are supported")]
    UnsupportedScheme,
}

/// Normalize a user-supplied environment URL.
///
/// The input must parse as an absolute http(s) URL. A bare root path with
/// no query or fragment collapses to the origin, so `http://host:4002/`
/// and `http://host:4002` store identically; anything else keeps every
/// component of the canonical serialization.
pub fn normalize_environment_url(input: &str) -> Result<String, UrlError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }
    let parsed = Url::parse(trimmed).map_err(|_| UrlError::Malformed)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(UrlError::UnsupportedScheme);
    }
    if parsed.path() == "/"
        && parsed.query().map_or(true, str::is_empty)
        && parsed.fragment().map_or(true, str::is_empty)
    {
        return Ok(parsed.origin().ascii_serialization());
    }
    Ok(parsed.to_string())
}

/// Join an environment base path with an inbound request path.
pub fn combine_paths(base_path: &str, request_path: &str) -> String {
    if base_path.is_empty() || base_path == "/" {
        return normalize_path(request_path);
    }
    let base = base_path.strip_suffix('/').unwrap_or(base_path);
    format!("{base}{}", normalize_path(request_path))
}

fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Upstream URL for a plain HTTP request: joined path, inbound query and
/// fragment carried over.
pub fn build_upstream_http_url(base: &Url, incoming: &Url) -> Url {
    build_upstream_url(base, incoming, None, true)
}

/// Upstream URL for a WebSocket handshake: http maps to ws, https to wss,
/// and the fragment is always dropped.
pub fn build_upstream_ws_url(base: &Url, incoming: &Url) -> Url {
    let scheme = if base.scheme() == "https" { "wss" } else { "ws" };
    build_upstream_url(base, incoming, Some(scheme), false)
}

fn build_upstream_url(
    base: &Url,
    incoming: &Url,
    scheme: Option<&str>,
    include_fragment: bool,
) -> Url {
    let mut url = base.clone();
    if let Some(scheme) = scheme {
        let _ = url.set_scheme(scheme);
    }
    url.set_path(&combine_paths(base.path(), incoming.path()));
    url.set_query(incoming.query().filter(|q| !q.is_empty()));
    url.set_fragment(if include_fragment {
        incoming.fragment().filter(|f| !f.is_empty())
    } else {
        None
    });
    url
}

/// Forward headers for a plain HTTP request.
pub fn build_http_forward_headers(
    headers: &HeaderMap,
    incoming: &Url,
    base: &Url,
) -> HeaderMap {
    let mut forwarded = headers.clone();
    insert_str(&mut forwarded, header::HOST, &host_with_port(base));
    insert_str(
        &mut forwarded,
        HeaderName::from_static("x-forwarded-host"),
        &host_with_port(incoming),
    );
    insert_str(
        &mut forwarded,
        HeaderName::from_static("x-forwarded-proto"),
        incoming.scheme(),
    );
    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("127.0.0.1")
        .to_string();
    insert_str(
        &mut forwarded,
        HeaderName::from_static("x-forwarded-for"),
        &forwarded_for,
    );
    forwarded
}

/// Forward headers for an upstream WebSocket handshake. The fixed excluded
/// set is regenerated by the connecting transport; an absent `Origin` is
/// synthesized from the upstream's own origin, since some backends reject
/// handshakes without one.
pub fn build_ws_forward_headers(headers: &HeaderMap, base: &Url) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if EXCLUDED_WEBSOCKET_HEADERS.contains(&name.as_str()) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    insert_str(&mut forwarded, header::HOST, &host_with_port(base));
    if !forwarded.contains_key(header::ORIGIN) {
        insert_str(
            &mut forwarded,
            header::ORIGIN,
            &base.origin().ascii_serialization(),
        );
    }
    forwarded
}

/// Rewrite an upstream `Location` header so redirects land back on the
/// proxy. Returns `None` when the value must pass through untouched: a
/// different origin than the active environment, or a value that does not
/// resolve against it.
pub fn rewrite_location(location: &str, proxy: &Url, base: &Url) -> Option<String> {
    let resolved = base.join(location).ok()?;
    if resolved.origin() != base.origin() {
        return None;
    }
    let mut rewritten = Url::parse(&proxy.origin().ascii_serialization()).ok()?;
    rewritten.set_path(&strip_base_path(
        resolved.path(),
        normalize_base_path(base.path()),
    ));
    rewritten.set_query(resolved.query());
    rewritten.set_fragment(resolved.fragment());
    Some(rewritten.to_string())
}

fn normalize_base_path(path: &str) -> &str {
    if path.is_empty() || path == "/" {
        return "";
    }
    path.strip_suffix('/').unwrap_or(path)
}

fn strip_base_path(path: &str, base: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }
    match path.strip_prefix(base) {
        Some(stripped) if stripped.starts_with('/') => stripped.to_string(),
        Some(stripped) => format!("/{stripped}"),
        None => path.to_string(),
    }
}

/// Reconstruct the absolute URL an inbound request arrived on. The proxy
/// itself serves plain http, so the scheme is fixed.
pub fn incoming_request_url<B>(req: &http::Request<B>) -> Option<Url> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
        .unwrap_or("localhost");
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Url::parse(&format!("http://{host}{path_and_query}")).ok()
}

/// Host with the non-default port, the way it appears in a `Host` header.
pub fn host_with_port(url: &Url) -> String {
    let host = url.host_str().unwrap_or("localhost");
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn insert_str(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_paths_joins_base_and_request() {
        assert_eq!(combine_paths("/base", "/api"), "/base/api");
        assert_eq!(combine_paths("", "/api"), "/api");
        assert_eq!(combine_paths("/base", "api"), "/base/api");
        assert_eq!(combine_paths("/base/", "/api"), "/base/api");
        assert_eq!(combine_paths("/", "/api"), "/api");
    }

    #[test]
    fn normalize_collapses_bare_root_to_origin() {
        assert_eq!(
            normalize_environment_url("http://localhost:4002/").unwrap(),
            "http://localhost:4002"
        );
        assert_eq!(
            normalize_environment_url("  https://example.com  ").unwrap(),
            "https://example.com"
        );
    }

    #[test]
    fn normalize_preserves_non_root_components() {
        assert_eq!(
            normalize_environment_url("http://backend:8080/app/?x=1#frag").unwrap(),
            "http://backend:8080/app/?x=1#frag"
        );
        assert_eq!(
            normalize_environment_url("https://example.com/base").unwrap(),
            "https://example.com/base"
        );
    }

    #[test]
    fn normalize_rejects_bad_input() {
        assert_eq!(normalize_environment_url("   "), Err(UrlError::Empty));
        assert_eq!(normalize_environment_url("not a url"), Err(UrlError::Malformed));
        assert_eq!(
            normalize_environment_url("ftp://example.com"),
            Err(UrlError::UnsupportedScheme)
        );
    }

    #[test]
    fn upstream_http_url_keeps_query_and_fragment() {
        let base = Url::parse("http://localhost:4000/base").unwrap();
        let incoming = Url::parse("http://proxy.local/path?x=1#hash").unwrap();
        assert_eq!(
            build_upstream_http_url(&base, &incoming).as_str(),
            "http://localhost:4000/base/path?x=1#hash"
        );
    }

    #[test]
    fn upstream_ws_url_switches_scheme_and_drops_fragment() {
        let base = Url::parse("https://example.com/base").unwrap();
        let incoming = Url::parse("http://proxy.local/ws?token=1#hash").unwrap();
        assert_eq!(
            build_upstream_ws_url(&base, &incoming).as_str(),
            "wss://example.com/base/ws?token=1"
        );

        let base = Url::parse("http://example.com/base").unwrap();
        let incoming = Url::parse("http://proxy.local/ws").unwrap();
        assert_eq!(
            build_upstream_ws_url(&base, &incoming).as_str(),
            "ws://example.com/base/ws"
        );
    }

    #[test]
    fn http_forward_headers_set_forwarding_fields() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("test-agent"));
        let incoming = Url::parse("http://proxy.local/api").unwrap();
        let base = Url::parse("http://backend:8080").unwrap();

        let forwarded = build_http_forward_headers(&headers, &incoming, &base);
        assert_eq!(forwarded.get("host").unwrap(), "backend:8080");
        assert_eq!(forwarded.get("x-forwarded-host").unwrap(), "proxy.local");
        assert_eq!(forwarded.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(forwarded.get("x-forwarded-for").unwrap(), "127.0.0.1");
        assert_eq!(forwarded.get("user-agent").unwrap(), "test-agent");
    }

    #[test]
    fn http_forward_headers_keep_existing_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1"));
        let incoming = Url::parse("http://proxy.local/api").unwrap();
        let base = Url::parse("http://backend:8080").unwrap();

        let forwarded = build_http_forward_headers(&headers, &incoming, &base);
        assert_eq!(forwarded.get("x-forwarded-for").unwrap(), "192.168.1.1");
    }

    #[test]
    fn ws_forward_headers_filter_handshake_set() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("test-agent"));
        headers.insert("connection", HeaderValue::from_static("upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("sec-websocket-key", HeaderValue::from_static("test-key"));
        headers.insert("sec-websocket-version", HeaderValue::from_static("13"));
        headers.insert("sec-websocket-protocol", HeaderValue::from_static("graphql-ws"));
        let base = Url::parse("https://backend:8080").unwrap();

        let forwarded = build_ws_forward_headers(&headers, &base);
        assert_eq!(forwarded.get("host").unwrap(), "backend:8080");
        assert_eq!(forwarded.get("user-agent").unwrap(), "test-agent");
        assert_eq!(forwarded.get("sec-websocket-protocol").unwrap(), "graphql-ws");
        assert!(forwarded.get("connection").is_none());
        assert!(forwarded.get("upgrade").is_none());
        assert!(forwarded.get("sec-websocket-key").is_none());
        assert!(forwarded.get("sec-websocket-version").is_none());
        assert_eq!(forwarded.get("origin").unwrap(), "https://backend:8080");
    }

    #[test]
    fn ws_forward_headers_keep_existing_origin() {
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_static("http://original-origin"));
        let base = Url::parse("http://backend:8080").unwrap();

        let forwarded = build_ws_forward_headers(&headers, &base);
        assert_eq!(forwarded.get("origin").unwrap(), "http://original-origin");
    }

    #[test]
    fn location_on_active_origin_is_rewritten_to_proxy() {
        let proxy = Url::parse("http://localhost:3200/app/login").unwrap();
        let base = Url::parse("http://backend:8080/app/").unwrap();
        assert_eq!(
            rewrite_location("http://backend:8080/app/login", &proxy, &base),
            Some("http://localhost:3200/login".to_string())
        );
    }

    #[test]
    fn relative_location_resolves_against_environment() {
        let proxy = Url::parse("http://localhost:3200/").unwrap();
        let base = Url::parse("http://backend:8080/app").unwrap();
        assert_eq!(
            rewrite_location("/app/next?step=2", &proxy, &base),
            Some("http://localhost:3200/next?step=2".to_string())
        );
    }

    #[test]
    fn location_on_other_origin_passes_through() {
        let proxy = Url::parse("http://localhost:3200/").unwrap();
        let base = Url::parse("http://backend:8080/app").unwrap();
        assert_eq!(
            rewrite_location("https://accounts.example.com/login", &proxy, &base),
            None
        );
    }

    #[test]
    fn location_outside_base_path_keeps_its_path() {
        let proxy = Url::parse("http://localhost:3200/").unwrap();
        let base = Url::parse("http://backend:8080/app").unwrap();
        assert_eq!(
            rewrite_location("http://backend:8080/other", &proxy, &base),
            Some("http://localhost:3200/other".to_string())
        );
    }
}
