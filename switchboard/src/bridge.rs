//! Two-legged WebSocket bridging.
//!
//! Each accepted upgrade becomes one independent task holding exactly one
//! client socket and one upstream socket. The selection snapshot is taken
//! at handshake time; a later environment switch never affects an
//! established bridge.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::StatusCode;
use http::header::{self, HeaderMap, HeaderValue};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_tungstenite::HyperWebsocket;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};
use url::Url;

use crate::rewrite;
use crate::store::EnvironmentStore;
use crate::{ProxyBody, full_body};

/// Accept a protocol-upgrade request and spawn the bridge task for it.
///
/// Fails closed: without an active selection the request is answered 503
/// before any upgrade is attempted, so no half-accepted handshake is ever
/// left behind.
pub fn handle_upgrade(req: &mut Request<Incoming>, store: &EnvironmentStore) -> Response<ProxyBody> {
    let selection = store.active_selection();
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
    let Some(incoming) = rewrite::incoming_request_url(req) else {
        return text_response(StatusCode::BAD_REQUEST, "Malformed request URL.");
    };

    let upstream_url = rewrite::build_upstream_ws_url(&base, &incoming);
    let forward_headers = rewrite::build_ws_forward_headers(req.headers(), &base);

    let (response, websocket) = match hyper_tungstenite::upgrade(&mut *req, None) {
        Ok(pair) => pair,
        Err(error) => {
            warn!(%error, "websocket upgrade failed");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "WebSocket upgrade failed.");
        }
    };

    tokio::spawn(bridge_connection(websocket, upstream_url, forward_headers));

    response.map(|body| body.map_err(|never| match never {}).boxed_unsync())
}

async fn bridge_connection(client: HyperWebsocket, upstream_url: Url, headers: HeaderMap) {
    let mut client = match client.await {
        Ok(stream) => stream,
        Err(error) => {
            debug!(%error, "client upgrade did not complete");
            return;
        }
    };

    let request = match upstream_handshake_request(&upstream_url, &headers) {
        Ok(request) => request,
        Err(error) => {
            warn!(%error, "invalid upstream handshake request");
            let _ = client
                .close(Some(close_frame(CloseCode::Error, "upstream connect failed")))
                .await;
            return;
        }
    };

    match connect_async(request).await {
        Ok((upstream, handshake)) => {
            debug!(status = %handshake.status(), upstream = %upstream_url, "bridge established");
            relay(client, upstream).await;
        }
        Err(error) => {
            warn!(%error, upstream = %upstream_url, "upstream websocket connect failed");
            let _ = client
                .close(Some(close_frame(CloseCode::Error, "upstream connect failed")))
                .await;
        }
    }
}

/// Handshake request for the upstream leg. The forwarded header set has
/// the per-connection handshake headers already removed; the ones added
/// here are freshly generated for this connection.
fn upstream_handshake_request(
    url: &Url,
    headers: &HeaderMap,
) -> Result<http::Request<()>, http::Error> {
    let mut builder = http::Request::builder()
        .uri(url.as_str())
        .header(header::SEC_WEBSOCKET_KEY, generate_key())
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket");
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder.body(())
}

/// Relay frames between the two legs until either side closes.
///
/// Generic over anything speaking `Message`, which keeps the state machine
/// independent of how either socket was established; the client leg comes
/// from a hyper upgrade and the upstream leg from a direct connect, but
/// both are driven identically.
async fn relay<C, U>(mut client: C, mut upstream: U)
where
    C: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
    U: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    loop {
        tokio::select! {
            frame = client.next() => match frame {
                Some(Ok(Message::Close(frame))) => {
                    // Mirror the client close upstream with the same code
                    // and reason.
                    let _ = upstream.send(Message::Close(frame)).await;
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(message)) => {
                    if upstream.send(message).await.is_err() {
                        let _ = client.send(close_message(CloseCode::Error, "proxy error")).await;
                        break;
                    }
                }
                Some(Err(error)) => {
                    debug!(%error, "client transport error");
                    let _ = upstream.send(close_message(CloseCode::Error, "proxy error")).await;
                    break;
                }
                None => {
                    let _ = upstream.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = upstream.next() => match frame {
                Some(Ok(Message::Close(frame))) => {
                    let _ = client.send(Message::Close(Some(mirror_upstream_close(frame)))).await;
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(message)) => {
                    if client.send(message).await.is_err() {
                        let _ = client.send(close_message(CloseCode::Error, "proxy error")).await;
                        break;
                    }
                }
                Some(Err(error)) => {
                    debug!(%error, "upstream transport error");
                    let _ = client.send(close_message(CloseCode::Error, "upstream error")).await;
                    break;
                }
                None => {
                    let _ = client
                        .send(Message::Close(Some(close_frame(CloseCode::Normal, "upstream closed"))))
                        .await;
                    break;
                }
            },
        }
    }

    // Releasing one leg always releases the other; no half-open pair may
    // linger.
    let _ = SinkExt::close(&mut client).await;
    let _ = SinkExt::close(&mut upstream).await;
}

/// An upstream close with no reason surfaces to the client as a normal
/// close explaining where it came from.
fn mirror_upstream_close(frame: Option<CloseFrame>) -> CloseFrame {
    match frame {
        Some(frame) if !frame.reason.is_empty() => frame,
        Some(frame) => close_frame(frame.code, "upstream closed"),
        None => close_frame(CloseCode::Normal, "upstream closed"),
    }
}

fn close_frame(code: CloseCode, reason: &'static str) -> CloseFrame {
    CloseFrame {
        code,
        reason: reason.into(),
    }
}

fn close_message(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(close_frame(code, reason)))
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
