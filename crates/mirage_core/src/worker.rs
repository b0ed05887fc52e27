use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use http::header::{HeaderName, HeaderValue, CONTENT_ENCODING};
use http::{Method, Request, Response};
use hyper::body::HttpBody as _;
use hyper::Body;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use mirage_net::fingerprint::{self, FingerprintProfile, ProfileId, SelectionPolicy};
use mirage_net::{Client, Error as NetError, Selector, UpstreamProxy};
use mirage_traits::{BatchResponse, FetchRequest, FetchResponse, Fetcher};

use crate::config::Config;

/// Outbound client settings shared by every cached profile client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub upstream: Option<UpstreamProxy>,
    pub accept_invalid_certs: bool,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
}

impl ClientOptions {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            upstream: config.upstream()?,
            accept_invalid_certs: config.accept_invalid_certs,
            handshake_timeout: config.handshake_timeout(),
            request_timeout: config.request_timeout(),
        })
    }
}

/// Bounded pool of concurrent fetches over one cached [`Client`] per profile.
#[derive(Clone)]
pub struct ScraperService {
    inner: Arc<Inner>,
}

struct Inner {
    options: ClientOptions,
    clients: DashMap<ProfileId, Client>,
    default_profile: &'static FingerprintProfile,
    selector: Selector,
    permits: Arc<Semaphore>,
    workers: usize,
    max_body: usize,
    fetch_timeout: Duration,
    batch_timeout: Duration,
}

impl ScraperService {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let options = ClientOptions::from_config(config)?;
        Ok(Self::with_options(
            options,
            config.profile(),
            config.selection,
            config.workers,
            config.max_body_bytes,
        )
        .with_timeouts(config.fetch_timeout(), config.batch_timeout()))
    }

    pub fn with_options(
        options: ClientOptions,
        default_profile: &'static FingerprintProfile,
        selection: SelectionPolicy,
        workers: usize,
        max_body: usize,
    ) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(Inner {
                options,
                clients: DashMap::new(),
                default_profile,
                selector: Selector::new(selection),
                permits: Arc::new(Semaphore::new(workers)),
                workers,
                max_body,
                fetch_timeout: Duration::from_secs(60),
                batch_timeout: Duration::from_secs(300),
            }),
        }
    }

    /// Only meaningful before the service is cloned.
    pub fn with_timeouts(mut self, fetch: Duration, batch: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.fetch_timeout = fetch;
            inner.batch_timeout = batch;
        }
        self
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.inner.fetch_timeout
    }

    pub fn batch_timeout(&self) -> Duration {
        self.inner.batch_timeout
    }

    pub fn default_profile(&self) -> &'static FingerprintProfile {
        self.inner.default_profile
    }

    /// Cached client for `profile`, built on first use.
    pub fn client_for(&self, profile: &'static FingerprintProfile) -> Client {
        self.inner
            .clients
            .entry(profile.id)
            .or_insert_with(|| {
                debug!(profile = %profile, "building client");
                let options = &self.inner.options;
                Client::builder(profile)
                    .upstream(options.upstream.clone())
                    .danger_accept_invalid_certs(options.accept_invalid_certs)
                    .handshake_timeout(options.handshake_timeout)
                    .request_timeout(options.request_timeout)
                    .build()
            })
            .clone()
    }

    /// Named profile when known; otherwise the configured default under the
    /// `first` policy, or whatever the selector picks.
    pub fn resolve_profile(&self, name: Option<&str>) -> &'static FingerprintProfile {
        if let Some(profile) = name.and_then(fingerprint::find) {
            return profile;
        }
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            debug!(fingerprint = name, "unknown fingerprint requested, using default");
            return self.inner.default_profile;
        }
        match self.inner.selector.policy() {
            SelectionPolicy::First => self.inner.default_profile,
            _ => self.inner.selector.pick(),
        }
    }

    /// Runs one fetch, waiting for a permit, all bounded by `deadline`.
    pub async fn fetch_before(&self, request: FetchRequest, deadline: Instant) -> FetchResponse {
        let started = Instant::now();
        let url = request.url.clone();
        match tokio::time::timeout_at(deadline, self.run(request, started)).await {
            Ok(response) => response,
            Err(_) => FetchResponse::failed(url, "deadline exceeded", elapsed_ms(started)),
        }
    }

    async fn run(&self, request: FetchRequest, started: Instant) -> FetchResponse {
        let _permit = match self.inner.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return FetchResponse::failed(request.url, "scraper is shut down", 0),
        };

        let profile = self.resolve_profile(request.fingerprint.as_deref());
        let client = self.client_for(profile);
        let url = request.url.clone();

        match self.fetch_with(&client, request).await {
            Ok((status_code, headers, body, error)) => FetchResponse {
                url,
                status_code,
                headers,
                body,
                error,
                duration_ms: elapsed_ms(started),
            },
            Err(e) => {
                debug!(%url, profile = %profile, error = %e, "fetch failed");
                FetchResponse::failed(url, e, elapsed_ms(started))
            }
        }
    }

    async fn fetch_with(
        &self,
        client: &Client,
        request: FetchRequest,
    ) -> Result<(u16, HashMap<String, String>, String, Option<String>), NetError> {
        let outbound = build_request(&request)?;
        let response = client.execute(outbound).await?;
        let status = response.status().as_u16();
        let headers = first_values(&response);
        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        let raw = match read_capped(response.into_body(), self.inner.max_body).await {
            Ok(raw) => raw,
            Err(e @ NetError::BodyTooLarge { .. }) => {
                return Ok((status, headers, String::new(), Some(e.to_string())))
            }
            Err(e) => return Err(e),
        };

        match decode_body(encoding.as_deref(), &raw, self.inner.max_body) {
            Ok(decoded) => Ok((status, headers, String::from_utf8_lossy(&decoded).into_owned(), None)),
            Err(e) => Ok((status, headers, String::new(), Some(e.to_string()))),
        }
    }
}

#[async_trait]
impl Fetcher for ScraperService {
    async fn fetch(&self, request: FetchRequest) -> FetchResponse {
        self.fetch_before(request, Instant::now() + self.inner.fetch_timeout)
            .await
    }

    async fn fetch_batch(&self, requests: Vec<FetchRequest>) -> BatchResponse {
        let deadline = Instant::now() + self.inner.batch_timeout;
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let url = request.url.clone();
                let service = self.clone();
                let handle = tokio::spawn(async move { service.fetch_before(request, deadline).await });
                (url, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (url, handle) in handles {
            match handle.await {
                Ok(response) => results.push(response),
                Err(e) => {
                    warn!(%url, error = %e, "fetch task aborted");
                    results.push(FetchResponse::failed(url, e, 0));
                }
            }
        }
        BatchResponse::from_results(results)
    }
}

fn build_request(request: &FetchRequest) -> Result<Request<Body>, NetError> {
    let method = Method::from_bytes(request.method().to_ascii_uppercase().as_bytes())
        .map_err(|e| NetError::request(format!("bad method {}: {e}", request.method())))?;
    let mut builder = Request::builder().method(method).uri(request.url.as_str());
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| NetError::request(format!("bad header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| NetError::request(format!("bad header value for {name}: {e}")))?;
        builder = builder.header(name, value);
    }
    let body = request.body.clone().map(Body::from).unwrap_or_else(Body::empty);
    Ok(builder.body(body)?)
}

/// First value per header name; repeated headers lose their later values.
fn first_values(response: &Response<Body>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    headers
}

/// Collects the body, failing once it grows past `limit` bytes.
pub async fn read_capped(mut body: Body, limit: usize) -> Result<Bytes, NetError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Err(NetError::BodyTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Undoes `gzip`, `deflate` and `br`; the decoded size is capped at `limit`.
pub fn decode_body(encoding: Option<&str>, raw: &[u8], limit: usize) -> Result<Vec<u8>, NetError> {
    let reader: Box<dyn Read + '_> = match encoding.map(str::trim) {
        Some("gzip") | Some("x-gzip") => Box::new(flate2::read::GzDecoder::new(raw)),
        Some("deflate") => Box::new(flate2::read::ZlibDecoder::new(raw)),
        Some("br") => Box::new(brotli::Decompressor::new(raw, 4096)),
        _ => return Ok(raw.to_vec()),
    };

    let mut out = Vec::new();
    reader.take(limit as u64 + 1).read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(NetError::BodyTooLarge { limit });
    }
    Ok(out)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn service(workers: usize, max_body: usize) -> ScraperService {
        let options = ClientOptions {
            upstream: None,
            accept_invalid_certs: false,
            handshake_timeout: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
        };
        ScraperService::with_options(
            options,
            fingerprint::select_default(),
            SelectionPolicy::First,
            workers,
            max_body,
        )
    }

    #[test]
    fn gzip_body_is_decoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"<html>hello</html>").unwrap();
        let compressed = encoder.finish().unwrap();

        let decoded = decode_body(Some("gzip"), &compressed, 1024).unwrap();
        assert_eq!(decoded, b"<html>hello</html>");
    }

    #[test]
    fn unknown_encoding_passes_through() {
        assert_eq!(decode_body(Some("identity"), b"plain", 16).unwrap(), b"plain");
        assert_eq!(decode_body(None, b"plain", 16).unwrap(), b"plain");
    }

    #[test]
    fn decoded_size_is_capped() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&[b'a'; 4096]).unwrap();
        let compressed = encoder.finish().unwrap();

        let err = decode_body(Some("gzip"), &compressed, 100).unwrap_err();
        assert!(matches!(err, NetError::BodyTooLarge { limit: 100 }));
    }

    #[tokio::test]
    async fn oversized_body_is_an_error() {
        let body = Body::from(vec![0u8; 64]);
        let err = read_capped(body, 32).await.unwrap_err();
        assert!(matches!(err, NetError::BodyTooLarge { limit: 32 }));

        let ok = read_capped(Body::from("small"), 32).await.unwrap();
        assert_eq!(&ok[..], b"small");
    }

    #[test]
    fn request_defaults_to_get_and_keeps_headers() {
        let mut request = FetchRequest::get("https://example.com/");
        request.headers.insert("X-Probe".into(), "1".into());
        let built = build_request(&request).unwrap();
        assert_eq!(built.method(), Method::GET);
        assert_eq!(built.headers()["x-probe"], "1");

        request.method = Some("post".into());
        request.body = Some("a=1".into());
        assert_eq!(build_request(&request).unwrap().method(), Method::POST);
    }

    #[test]
    fn bad_header_is_a_request_error() {
        let mut request = FetchRequest::get("https://example.com/");
        request.headers.insert("bad header".into(), "1".into());
        assert!(matches!(build_request(&request), Err(NetError::RequestBuild(_))));
    }

    #[test]
    fn profile_resolution() {
        let scraper = service(1, 1024);
        assert_eq!(scraper.resolve_profile(Some("firefox")).id, ProfileId::Firefox);
        assert_eq!(scraper.resolve_profile(Some("netscape")).id, ProfileId::Chrome);
        assert_eq!(scraper.resolve_profile(None).id, ProfileId::Chrome);
    }

    #[tokio::test]
    async fn clients_are_cached_per_profile() {
        let scraper = service(1, 1024);
        let a = scraper.client_for(fingerprint::select_default());
        let b = scraper.client_for(fingerprint::select_default());
        assert!(Arc::ptr_eq(a.router(), b.router()));
    }

    #[tokio::test]
    async fn unsupported_scheme_is_reported_not_raised() {
        let scraper = service(2, 1024);
        let response = scraper.fetch(FetchRequest::get("ftp://example.com/")).await;
        assert_eq!(response.status_code, 0);
        assert!(response.error.is_some());
        assert!(!response.is_success());
        assert_eq!(scraper.available_permits(), 2);
    }

    #[tokio::test]
    async fn waiting_for_a_permit_counts_against_the_deadline() {
        let scraper = service(1, 1024);
        let _held = scraper.inner.permits.clone().acquire_owned().await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let response = scraper
            .fetch_before(FetchRequest::get("http://127.0.0.1:9/"), deadline)
            .await;
        assert_eq!(response.error.as_deref(), Some("deadline exceeded"));
    }

    #[tokio::test]
    async fn batch_keeps_order_and_tallies() {
        let scraper = service(4, 1024);
        let requests = vec![
            FetchRequest::get("ftp://a.test/"),
            FetchRequest::get("not a url"),
            FetchRequest::get("gopher://c.test/"),
        ];
        let batch = scraper.fetch_batch(requests).await;
        assert_eq!(batch.total, 3);
        assert_eq!(batch.success, 0);
        assert_eq!(batch.failed, 3);
        let urls: Vec<_> = batch.results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, ["ftp://a.test/", "not a url", "gopher://c.test/"]);
    }
}
