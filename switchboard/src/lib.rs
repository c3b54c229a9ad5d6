//! Core engine of the switchboard dev proxy: the environment-selection
//! store, the HTTP reverse-proxy dispatcher, and the WebSocket bridge.
//!
//! The outer surfaces (CLI, admin UI, port binding) live in
//! `switchboard-cli` and are built entirely on the public operations
//! exposed here.

pub mod bridge;
pub mod proxy;
pub mod rewrite;
pub mod store;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};

/// Body type produced by the dispatcher and the bridge handshake path.
pub type ProxyBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// A fixed-content body, for error pages and handshake responses.
pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// An empty body.
pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}
