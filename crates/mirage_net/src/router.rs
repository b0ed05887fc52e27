use std::sync::Arc;

use http::header::{HeaderValue, HOST};
use http::uri::{PathAndQuery, Uri};
use http::{Request, Response};
use hyper::Body;

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintProfile;
use crate::pool::H2Pool;
use crate::proxy::{open_tcp, UpstreamProxy};
use crate::session::H2Session;
use crate::tls::{Alpn, TlsDialer};
use crate::transport::{join_host_port, BoxedStream};

/// Turns requests into wire traffic, picking HTTP/1.1 or HTTP/2 from what
/// the handshake negotiated.
///
/// `https` goes through the fingerprinting dialer and the HTTP/2 pool.
/// `http` gets a fresh one-shot HTTP/1.1 connection. Nothing is retried here.
pub struct ProtocolRouter {
    dialer: Arc<dyn TlsDialer>,
    profile: &'static FingerprintProfile,
    upstream: Option<UpstreamProxy>,
    pool: H2Pool,
}

impl ProtocolRouter {
    pub fn new(dialer: Arc<dyn TlsDialer>, profile: &'static FingerprintProfile) -> Self {
        Self {
            dialer,
            profile,
            upstream: None,
            pool: H2Pool::new(),
        }
    }

    /// Upstream used for plain `http` requests; TLS dials go through the dialer's own.
    pub fn with_upstream(mut self, upstream: Option<UpstreamProxy>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn profile(&self) -> &'static FingerprintProfile {
        self.profile
    }

    pub fn pool(&self) -> &H2Pool {
        &self.pool
    }

    pub async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>> {
        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| Error::request(format!("URL has no host: {uri}")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();

        let (tls, port) = match uri.scheme_str() {
            Some("https") => (true, uri.port_u16().unwrap_or(443)),
            Some("http") => (false, uri.port_u16().unwrap_or(80)),
            Some(other) => return Err(Error::request(format!("unsupported scheme: {other}"))),
            None => return Err(Error::request(format!("URL has no scheme: {uri}"))),
        };

        if tls {
            self.send_tls(request, &host, port).await
        } else {
            self.send_plain(request, &host, port).await
        }
    }

    async fn send_plain(&self, request: Request<Body>, host: &str, port: u16) -> Result<Response<Body>> {
        let key = join_host_port(host, port);
        let stream = open_tcp(self.upstream.as_ref(), host, port).await?;
        send_http1(stream, request, &key).await
    }

    async fn send_tls(&self, request: Request<Body>, host: &str, port: u16) -> Result<Response<Body>> {
        let key = join_host_port(host, port);

        if let Some(session) = self.pool.get(&key) {
            return self.send_pooled(&key, session, request).await;
        }

        let route = if self.pool.is_http1(&key) {
            self.establish(&key, host, port).await?
        } else {
            let gate = self.pool.gate(&key);
            let established = {
                let _guard = gate.lock().await;
                match self.pool.get(&key) {
                    Some(session) => {
                        tracing::trace!(%key, "reusing session created by a concurrent dial");
                        Ok(Route::H2(session))
                    }
                    None => self.establish(&key, host, port).await,
                }
            };
            self.pool.release_gate(&key, gate);
            established?
        };

        match route {
            Route::H2(session) => self.send_pooled(&key, session, request).await,
            Route::Http1(stream) => send_http1(stream, request, &key).await,
        }
    }

    /// Dials and, when HTTP/2 was negotiated, installs the new session.
    async fn establish(&self, key: &str, host: &str, port: u16) -> Result<Route> {
        let connection = self.dialer.dial(host, port, self.profile).await?;

        match connection.alpn {
            Alpn::H2 => {
                let session =
                    H2Session::handshake(connection.stream, &self.profile.http2, key).await?;
                self.pool.insert(key, session.clone());
                tracing::debug!(%key, profile = %self.profile, "pooled new HTTP/2 session");
                Ok(Route::H2(session))
            }
            Alpn::Http1 | Alpn::None => {
                self.pool.mark_http1(key);
                Ok(Route::Http1(connection.stream))
            }
        }
    }

    async fn send_pooled(
        &self,
        key: &str,
        session: H2Session,
        request: Request<Body>,
    ) -> Result<Response<Body>> {
        match session.send(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.pool.evict(key, &session);
                Err(e)
            }
        }
    }
}

enum Route {
    H2(H2Session),
    Http1(BoxedStream),
}

/// One request over a connection that is already open.
///
/// The connection closes once the response body has been read.
async fn send_http1(stream: BoxedStream, mut request: Request<Body>, key: &str) -> Result<Response<Body>> {
    to_origin_form(&mut request)?;

    let (mut sender, connection) = hyper::client::conn::Builder::new()
        .handshake::<_, Body>(stream)
        .await?;
    let label = key.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(addr = %label, error = %e, "HTTP/1.1 connection closed with error");
        }
    });

    Ok(sender.send_request(request).await?)
}

/// Moves the authority into `Host` and leaves only path and query in the URI.
fn to_origin_form(request: &mut Request<Body>) -> Result<()> {
    let uri = request.uri().clone();
    if let Some(authority) = uri.authority() {
        if !request.headers().contains_key(HOST) {
            let value = HeaderValue::from_str(authority.as_str())
                .map_err(|e| Error::request(format!("bad authority {authority}: {e}")))?;
            request.headers_mut().insert(HOST, value);
        }
    }

    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *request.uri_mut() = Uri::builder().path_and_query(path).build()?;
    Ok(())
}
