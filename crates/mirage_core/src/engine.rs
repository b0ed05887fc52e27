use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::frontend;
use crate::state::AppState;

/// Accept loop for the proxy listener. Every connection gets its own task.
pub struct ProxyEngine {
    state: Arc<AppState>,
    listener: TcpListener,
}

impl ProxyEngine {
    pub async fn bind(state: Arc<AppState>) -> Result<Self> {
        let addr = state.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::from_listener(state, listener))
    }

    pub fn from_listener(state: Arc<AppState>, listener: TcpListener) -> Self {
        Self { state, listener }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs until `shutdown` resolves. Connections already accepted keep
    /// running in their own tasks.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            %addr,
            profile = %self.state.profile,
            auth = self.state.auth_enabled(),
            upstream = self.state.upstream.is_some(),
            api = self.state.config.api_enabled,
            "proxy listening"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, no longer accepting");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(self.state.clone(), stream, peer));
                }
            }
        }
        Ok(())
    }
}

async fn serve_connection(state: Arc<AppState>, stream: tokio::net::TcpStream, peer: SocketAddr) {
    let service = service_fn(move |req| frontend::handle(state.clone(), peer, req));
    if let Err(e) = Http::new()
        .http1_only(true)
        .http1_keep_alive(true)
        .serve_connection(stream, service)
        .with_upgrades()
        .await
    {
        debug!(%peer, error = %e, "connection ended with error");
    }
}
