use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use hyper::service::service_fn;
use hyper::Body;
use tokio::io::DuplexStream;

use mirage_net::fingerprint::{select_default, FingerprintProfile};
use mirage_net::{Alpn, Client, Connection, Error, ProtocolRouter, Result, TlsDialer};

/// Hands out in-memory connections and counts how many were dialed.
struct MockDialer {
    alpn: Alpn,
    delay: Duration,
    fail: bool,
    stream_limit: Option<u32>,
    handshakes: AtomicUsize,
}

impl MockDialer {
    fn new(alpn: Alpn) -> Self {
        Self {
            alpn,
            delay: Duration::ZERO,
            fail: false,
            stream_limit: None,
            handshakes: AtomicUsize::new(0),
        }
    }

    fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TlsDialer for MockDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        _profile: &'static FingerprintProfile,
    ) -> Result<Connection> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(Error::HandshakeTimeout {
                addr: format!("{host}:{port}"),
                timeout: Duration::from_secs(10),
            });
        }

        let (client, server) = tokio::io::duplex(64 * 1024);
        match self.alpn {
            Alpn::H2 => tokio::spawn(serve_h2(server, self.stream_limit)),
            Alpn::Http1 | Alpn::None => tokio::spawn(serve_h1(server)),
        };
        Ok(Connection {
            stream: Box::new(client),
            alpn: self.alpn,
        })
    }
}

/// `/reset` is answered with RST_STREAM, `/hold` with a body that never
/// ends, everything else with the path.
async fn serve_h2(io: DuplexStream, stream_limit: Option<u32>) {
    let mut builder = h2::server::Builder::new();
    if let Some(limit) = stream_limit {
        builder.max_concurrent_streams(limit);
    }
    let mut connection = match builder.handshake::<_, Bytes>(io).await {
        Ok(c) => c,
        Err(_) => return,
    };
    let mut held = Vec::new();
    while let Some(Ok((request, mut respond))) = connection.accept().await {
        let path = request.uri().path().to_string();
        if path == "/reset" {
            respond.send_reset(h2::Reason::INTERNAL_ERROR);
            continue;
        }
        if path == "/hold" {
            let response = Response::builder().status(StatusCode::OK).body(()).unwrap();
            held.push(respond.send_response(response, false).unwrap());
            continue;
        }
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("x-proto", "h2")
            .body(())
            .unwrap();
        let mut send = respond.send_response(response, false).unwrap();
        send.send_data(Bytes::from(path), true).unwrap();
    }
}

/// Echoes the request's User-Agent.
async fn serve_h1(io: DuplexStream) {
    let service = service_fn(|request: Request<Body>| async move {
        let agent = request
            .headers()
            .get(http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none")
            .to_string();
        Ok::<_, hyper::Error>(Response::new(Body::from(agent)))
    });
    let _ = hyper::server::conn::Http::new()
        .http1_only(true)
        .serve_connection(io, service)
        .await;
}

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("mirage_net=trace")
        .with_test_writer()
        .try_init();
}

fn get(url: &str) -> Request<Body> {
    Request::get(url).body(Body::empty()).unwrap()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn h2_session_is_pooled_and_reused() {
    let dialer = Arc::new(MockDialer::new(Alpn::H2));
    let router = ProtocolRouter::new(dialer.clone(), select_default());

    let first = router.round_trip(get("https://mock.test/one")).await.unwrap();
    assert_eq!(first.headers()["x-proto"], "h2");
    assert_eq!(body_string(first).await, "/one");
    assert_eq!(router.pool().len(), 1);
    assert!(router.pool().contains("mock.test:443"));

    let second = router.round_trip(get("https://mock.test/two")).await.unwrap();
    assert_eq!(body_string(second).await, "/two");
    assert_eq!(dialer.handshakes(), 1);
    assert_eq!(router.pool().len(), 1);
}

#[tokio::test]
async fn failed_pooled_request_evicts_and_next_call_redials() {
    init_logs();
    let dialer = Arc::new(MockDialer::new(Alpn::H2));
    let router = ProtocolRouter::new(dialer.clone(), select_default());

    router.round_trip(get("https://mock.test/")).await.unwrap();
    assert_eq!(dialer.handshakes(), 1);

    let err = router.round_trip(get("https://mock.test/reset")).await.unwrap_err();
    assert!(matches!(err, Error::H2(_)), "{err}");
    assert!(!router.pool().contains("mock.test:443"));
    assert_eq!(dialer.handshakes(), 1);

    let again = router.round_trip(get("https://mock.test/again")).await.unwrap();
    assert_eq!(body_string(again).await, "/again");
    assert_eq!(dialer.handshakes(), 2);
    assert_eq!(router.pool().len(), 1);
}

#[tokio::test]
async fn concurrent_first_requests_share_one_handshake() {
    init_logs();
    let mut mock = MockDialer::new(Alpn::H2);
    mock.delay = Duration::from_millis(100);
    let dialer = Arc::new(mock);
    let router = Arc::new(ProtocolRouter::new(dialer.clone(), select_default()));

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let router = router.clone();
            tokio::spawn(async move {
                let response = router
                    .round_trip(get(&format!("https://mock.test/{i}")))
                    .await
                    .unwrap();
                body_string(response).await
            })
        })
        .collect();

    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), format!("/{i}"));
    }
    assert_eq!(dialer.handshakes(), 1);
    assert_eq!(router.pool().len(), 1);
    assert_eq!(router.pool().gate_count(), 0);
}

#[tokio::test]
async fn session_at_peer_stream_limit_is_not_reused() {
    let mut mock = MockDialer::new(Alpn::H2);
    mock.stream_limit = Some(1);
    let dialer = Arc::new(mock);
    let router = ProtocolRouter::new(dialer.clone(), select_default());

    let held = router.round_trip(get("https://mock.test/hold")).await.unwrap();
    assert_eq!(held.status(), StatusCode::OK);

    let second = tokio::time::timeout(
        Duration::from_secs(2),
        router.round_trip(get("https://mock.test/two")),
    )
    .await
    .expect("second request queued behind a full session")
    .unwrap();
    assert_eq!(body_string(second).await, "/two");
    assert_eq!(dialer.handshakes(), 2);
    assert_eq!(router.pool().len(), 1);
    drop(held);
}

#[tokio::test]
async fn distinct_ports_get_distinct_sessions() {
    let dialer = Arc::new(MockDialer::new(Alpn::H2));
    let router = ProtocolRouter::new(dialer.clone(), select_default());

    router.round_trip(get("https://mock.test/")).await.unwrap();
    router.round_trip(get("https://mock.test:8443/")).await.unwrap();

    assert_eq!(dialer.handshakes(), 2);
    assert!(router.pool().contains("mock.test:443"));
    assert!(router.pool().contains("mock.test:8443"));
}

#[tokio::test]
async fn http1_negotiation_bypasses_pool() {
    let dialer = Arc::new(MockDialer::new(Alpn::Http1));
    let router = ProtocolRouter::new(dialer.clone(), select_default());

    let response = router
        .round_trip(
            Request::get("https://mock.test/")
                .header(http::header::USER_AGENT, "probe")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "probe");

    router.round_trip(get("https://mock.test/")).await.unwrap();
    assert_eq!(dialer.handshakes(), 2);
    assert!(router.pool().is_empty());
    assert!(router.pool().is_http1("mock.test:443"));
}

#[tokio::test]
async fn missing_alpn_is_treated_as_http1() {
    let dialer = Arc::new(MockDialer::new(Alpn::None));
    let router = ProtocolRouter::new(dialer.clone(), select_default());

    let response = router.round_trip(get("https://mock.test/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(router.pool().is_empty());
}

#[tokio::test]
async fn handshake_failure_leaves_pool_untouched() {
    let mut mock = MockDialer::new(Alpn::H2);
    mock.fail = true;
    let router = ProtocolRouter::new(Arc::new(mock), select_default());

    let err = router.round_trip(get("https://mock.test/")).await.unwrap_err();
    assert!(matches!(err, Error::HandshakeTimeout { .. }), "{err}");
    assert!(err.is_connect());
    assert!(router.pool().is_empty());
}

#[tokio::test]
async fn unsupported_scheme_is_a_request_error() {
    let router = ProtocolRouter::new(Arc::new(MockDialer::new(Alpn::H2)), select_default());
    let err = router.round_trip(get("ftp://mock.test/")).await.unwrap_err();
    assert!(matches!(err, Error::RequestBuild(_)), "{err}");
}

#[tokio::test]
async fn client_fills_user_agent_from_profile() {
    let router = ProtocolRouter::new(Arc::new(MockDialer::new(Alpn::Http1)), select_default());
    let client = Client::from_router(Arc::new(router));

    let response = client.execute(get("https://mock.test/")).await.unwrap();
    assert_eq!(body_string(response).await, select_default().user_agent);
}

#[tokio::test]
async fn client_deadline_maps_to_cancelled() {
    let mut mock = MockDialer::new(Alpn::H2);
    mock.delay = Duration::from_millis(500);
    let router = ProtocolRouter::new(Arc::new(mock), select_default());
    let client = Client::from_router(Arc::new(router));

    let err = client
        .execute_with_timeout(get("https://mock.test/"), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)), "{err}");
}
