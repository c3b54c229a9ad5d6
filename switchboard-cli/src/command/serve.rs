//! Serve command - runs the forwarding proxy and the admin surface.

use std::convert::Infallible;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info};

use switchboard::bridge;
use switchboard::proxy::ProxyDispatcher;
use switchboard::store::EnvironmentStore;

use crate::admin;
use crate::command::DATA_FILE_NAME;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Port the forwarding proxy listens on
    #[arg(short, long, env = "SWITCHBOARD_PORT", default_value_t = 3200)]
    port: u16,

    /// Port the admin UI/API listens on
    #[arg(long, env = "SWITCHBOARD_ADMIN_PORT", default_value_t = 3201)]
    admin_port: u16,

    /// Host both listeners bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

pub async fn execute(args: &Args, data_dir: &Path) -> Result<()> {
    let data_file = data_dir.join(DATA_FILE_NAME);
    let store = Arc::new(EnvironmentStore::new(&data_file));
    store
        .init()
        .await
        .context("Failed to load environment state")?;
    let dispatcher =
        Arc::new(ProxyDispatcher::new(store.clone()).context("Failed to build the HTTP client")?);

    let proxy_listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Failed to bind proxy port {}", args.port))?;
    let admin_listener = TcpListener::bind((args.host.as_str(), args.admin_port))
        .await
        .with_context(|| format!("Failed to bind admin port {}", args.admin_port))?;

    println!("[proxy] listening on http://{}:{}", args.host, args.port);
    println!(
        "[admin] UI/API available at http://{}:{}/",
        args.host, args.admin_port
    );

    let proxy_task = tokio::spawn(run_proxy(proxy_listener, store.clone(), dispatcher));
    let admin_task = tokio::spawn(run_admin(admin_listener, store.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
        result = proxy_task => result.context("proxy listener task failed")?,
        result = admin_task => result.context("admin listener task failed")?,
    }
}

/// Accept loop for the forwarding port. Every request is classified before
/// dispatch: protocol upgrades go to the bridge, everything else to the
/// dispatcher.
async fn run_proxy(
    listener: TcpListener,
    store: Arc<EnvironmentStore>,
    dispatcher: Arc<ProxyDispatcher>,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("proxy accept failed")?;
        let store = store.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let service = service_fn(move |mut req| {
                let store = store.clone();
                let dispatcher = dispatcher.clone();
                async move {
                    let response = if hyper_tungstenite::is_upgrade_request(&req) {
                        bridge::handle_upgrade(&mut req, &store)
                    } else {
                        dispatcher.handle(req).await
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(error) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                debug!(%error, %peer, "proxy connection ended with error");
            }
        });
    }
}

async fn run_admin(listener: TcpListener, store: Arc<EnvironmentStore>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.context("admin accept failed")?;
        let store = store.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let store = store.clone();
                async move { Ok::<_, Infallible>(admin::handle(req, &store).await) }
            });
            if let Err(error) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%error, %peer, "admin connection ended with error");
            }
        });
    }
}
