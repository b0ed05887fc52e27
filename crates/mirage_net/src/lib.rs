//! Browser-fingerprinted HTTP transport.
//!
//! TLS handshakes are shaped after real browsers, HTTP/2 sessions are pooled
//! per destination, and everything can be chained through an upstream proxy.

pub mod error;
pub mod fingerprint;
pub mod headers;
pub mod pool;
pub mod proxy;
pub mod router;
pub mod session;
pub mod tls;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use http::{Method, Request, Response};
use hyper::Body;

pub use error::{Error, Result};
pub use fingerprint::{FingerprintProfile, SelectionPolicy, Selector};
pub use proxy::UpstreamProxy;
pub use router::ProtocolRouter;
pub use tls::{Alpn, BoringDialer, Connection, TlsDialer};

/// Deadline applied by [`Client::execute`] when the caller sets none.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One fingerprint profile bound to one router.
#[derive(Clone)]
pub struct Client {
    router: Arc<ProtocolRouter>,
    request_timeout: Duration,
}

impl Client {
    /// Direct connections, platform trust store, default timeouts.
    pub fn new(profile: &'static FingerprintProfile) -> Self {
        Self::builder(profile).build()
    }

    pub fn builder(profile: &'static FingerprintProfile) -> ClientBuilder {
        ClientBuilder {
            profile,
            upstream: None,
            accept_invalid_certs: false,
            handshake_timeout: tls::HANDSHAKE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            root_certs: Vec::new(),
        }
    }

    pub fn from_router(router: Arc<ProtocolRouter>) -> Self {
        Self {
            router,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn profile(&self) -> &'static FingerprintProfile {
        self.router.profile()
    }

    pub fn router(&self) -> &Arc<ProtocolRouter> {
        &self.router
    }

    /// GET with the profile's full navigation header set.
    pub async fn get(&self, url: &str) -> Result<Response<Body>> {
        let mut request = Request::get(url).body(Body::empty())?;
        for &(name, value) in self.profile().default_headers {
            request.headers_mut().insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        self.execute(request).await
    }

    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<Body>,
    ) -> Result<Response<Body>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(CONTENT_TYPE, content_type)
            .body(body.into())?;
        self.execute(request).await
    }

    /// Sends `request` under the client's default deadline.
    pub async fn execute(&self, request: Request<Body>) -> Result<Response<Body>> {
        self.execute_with_timeout(request, self.request_timeout).await
    }

    /// Fills in `User-Agent` if absent and bounds the exchange up to the
    /// response head by `deadline`.
    pub async fn execute_with_timeout(
        &self,
        mut request: Request<Body>,
        deadline: Duration,
    ) -> Result<Response<Body>> {
        if !request.headers().contains_key(USER_AGENT) {
            request.headers_mut().insert(
                USER_AGENT,
                HeaderValue::from_static(self.profile().user_agent),
            );
        }
        tokio::time::timeout(deadline, self.router.round_trip(request)).await?
    }
}

pub struct ClientBuilder {
    profile: &'static FingerprintProfile,
    upstream: Option<UpstreamProxy>,
    accept_invalid_certs: bool,
    handshake_timeout: Duration,
    request_timeout: Duration,
    root_certs: Vec<Vec<u8>>,
}

impl ClientBuilder {
    pub fn upstream(mut self, upstream: Option<UpstreamProxy>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn root_certificates(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.root_certs = certs;
        self
    }

    pub fn build(self) -> Client {
        let dialer = BoringDialer::new()
            .with_upstream(self.upstream.clone())
            .with_handshake_timeout(self.handshake_timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .with_root_certificates(self.root_certs);
        let router = ProtocolRouter::new(Arc::new(dialer), self.profile).with_upstream(self.upstream);
        Client {
            router: Arc::new(router),
            request_timeout: self.request_timeout,
        }
    }
}
