//! Plain HTTP/HTTPS request forwarding.

use std::sync::Arc;

use futures_util::TryStreamExt;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Request, Response};
use tracing::{debug, error};
use url::Url;

use crate::rewrite;
use crate::store::EnvironmentStore;
use crate::{ProxyBody, full_body};

/// Connection-level headers that belong to one hop. The original runtime's
/// `fetch()` strips these internally; over raw hyper it is done here.
const HOP_BY_HOP_HEADERS: [&str; 5] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// Forwards every plain request to the currently active environment.
pub struct ProxyDispatcher {
    store: Arc<EnvironmentStore>,
    client: reqwest::Client,
}

impl ProxyDispatcher {
    /// Redirects are never auto-followed; the dispatcher inspects the raw
    /// upstream response itself.
    pub fn new(store: Arc<EnvironmentStore>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { store, client })
    }

    /// Handle one inbound request. Never fails: every failure mode maps to
    /// an error response (503 without a selection, 502 on an unreachable
    /// upstream).
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let selection = self.store.active_selection();
        let Some(active_url) = selection.url else {
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "No environment selected. Open the admin UI to choose one.",
            );
        };
        let Ok(base) = Url::parse(&active_url) else {
            return text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "The active environment URL is not usable.",
            );
        };
        let Some(incoming) = rewrite::incoming_request_url(&req) else {
            return text_response(StatusCode::BAD_REQUEST, "Malformed request URL.");
        };

        let upstream_url = rewrite::build_upstream_http_url(&base, &incoming);
        let mut headers = rewrite::build_http_forward_headers(req.headers(), &incoming, &base);
        strip_hop_by_hop(&mut headers);

        let method = req.method().clone();
        debug!(%method, upstream = %upstream_url, "forwarding request");

        let mut upstream_request = self
            .client
            .request(method.clone(), upstream_url)
            .headers(headers);
        if should_have_body(&method) {
            upstream_request = upstream_request
                .body(reqwest::Body::wrap_stream(req.into_body().into_data_stream()));
        }

        let upstream_response = match upstream_request.send().await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "upstream fetch failed");
                return text_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("Failed to reach the upstream environment: {err}"),
                );
            }
        };

        self.build_response(upstream_response, &incoming, &base)
    }

    fn build_response(
        &self,
        upstream: reqwest::Response,
        incoming: &Url,
        base: &Url,
    ) -> Response<ProxyBody> {
        let status = upstream.status();
        let mut headers = upstream.headers().clone();

        // An upgrade handshake passes through completely unmodified.
        if !is_upgrade_response(status, &headers) {
            strip_hop_by_hop(&mut headers);
            let rewritten = headers
                .get(header::LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|location| rewrite::rewrite_location(location, incoming, base));
            if let Some(location) = rewritten {
                if let Ok(value) = HeaderValue::from_str(&location) {
                    headers.insert(header::LOCATION, value);
                }
            }
        }

        let stream = upstream
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(std::io::Error::other);
        let mut response = Response::new(StreamBody::new(stream).boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

fn should_have_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

fn is_upgrade_response(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::SWITCHING_PROTOCOLS {
        return true;
    }
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
