//! Inbound HTTP server
//!
//! HTTP/1.1 over hyper. On shutdown the listener stops accepting, open
//! connections are asked to finish their current request, and the server
//! waits up to [`DRAIN_TIMEOUT`] for them.

mod handler;

pub use handler::{error_body, handle_request, parse_chat_request, ChatCompletionRequest};

use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Grace period for in-flight requests after shutdown starts
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Server {
    gateway: Arc<Gateway>,
    listener: TcpListener,
    max_body_size: usize,
}

impl Server {
    pub async fn bind(gateway: Arc<Gateway>, address: &str, max_body_size: usize) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| GatewayError::Config(format!("Failed to bind {}: {}", address, e)))?;
        Ok(Self {
            gateway,
            listener,
            max_body_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `shutdown` resolves, then drain
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        info!(address = %self.local_addr()?, "Listening");

        let sweeper = self.gateway.spawn_background();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    connections.spawn(serve_connection(
                        stream,
                        addr,
                        self.gateway.clone(),
                        self.max_body_size,
                        stop_rx.clone(),
                    ));
                }
                _ = &mut shutdown => break,
            }
        }

        info!(active = connections.len(), "Shutting down, draining connections");
        let _ = stop_tx.send(true);
        drop(self.listener);

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "Drain timeout, aborting connections");
            connections.abort_all();
        }

        if let Some(handle) = sweeper {
            handle.abort();
        }
        info!("Server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    max_body_size: usize,
    mut stop: watch::Receiver<bool>,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| handle_request(req, gateway.clone(), max_body_size));
    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    let stopping = async {
        let _ = stop.wait_for(|stopping| *stopping).await;
    };
    let finished = tokio::select! {
        result = conn.as_mut() => Some(result),
        _ = stopping => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        if !e.is_incomplete_message() {
            debug!(client = %addr, error = %e, "HTTP connection error");
        }
    }
}

/// Resolves on Ctrl-C
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}
