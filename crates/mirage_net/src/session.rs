use std::future::{poll_fn, Future};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use h2::client::{Builder, SendRequest};
use h2::{RecvStream, SendStream};
use http::{header, Request, Response};
use hyper::body::{HttpBody, Sender};
use hyper::Body;

use crate::error::{Error, Result};
use crate::fingerprint::Http2Settings;
use crate::headers::strip_hop_by_hop;
use crate::transport::BoxedStream;

/// Assumed peer stream limit until the server's SETTINGS arrive.
const DEFAULT_STREAM_LIMIT: usize = 100;

/// One multiplexed HTTP/2 connection, shareable across tasks.
///
/// Clones share the same connection and counters.
#[derive(Clone)]
pub struct H2Session {
    send: SendRequest<Bytes>,
    closed: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    /// `SETTINGS_MAX_CONCURRENT_STREAMS` as last announced by the server.
    peer_limit: Arc<AtomicUsize>,
}

impl std::fmt::Debug for H2Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Session")
            .field("closed", &self.is_closed())
            .field("in_flight", &self.in_flight())
            .field("peer_limit", &self.peer_limit())
            .finish()
    }
}

impl H2Session {
    /// Sends the connection preface with the profile's SETTINGS and window,
    /// then spawns the connection driver.
    pub async fn handshake(
        stream: BoxedStream,
        settings: &Http2Settings,
        label: &str,
    ) -> Result<Self> {
        let mut builder = Builder::new();
        builder
            .initial_window_size(settings.initial_window_size)
            .initial_connection_window_size(settings.initial_connection_window_size);
        if let Some(size) = settings.header_table_size {
            builder.header_table_size(size);
        }
        if let Some(push) = settings.enable_push {
            builder.enable_push(push);
        }
        if let Some(max) = settings.max_concurrent_streams {
            builder.max_concurrent_streams(max);
        }
        if let Some(size) = settings.max_frame_size {
            builder.max_frame_size(size);
        }
        if let Some(size) = settings.max_header_list_size {
            builder.max_header_list_size(size);
        }

        let (send, connection) = builder.handshake::<_, Bytes>(stream).await?;

        let closed = Arc::new(AtomicBool::new(false));
        let peer_limit = Arc::new(AtomicUsize::new(DEFAULT_STREAM_LIMIT));
        let flag = closed.clone();
        let limit = peer_limit.clone();
        let label = label.to_string();
        tokio::spawn(async move {
            tokio::pin!(connection);
            let result = poll_fn(|cx| {
                let polled = connection.as_mut().poll(cx);
                limit.store(connection.max_concurrent_send_streams(), Ordering::Release);
                polled
            })
            .await;
            if let Err(e) = result {
                tracing::debug!(addr = %label, error = %e, "HTTP/2 connection driver exited");
            }
            flag.store(true, Ordering::Release);
        });

        Ok(Self {
            send,
            closed,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peer_limit,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn peer_limit(&self) -> usize {
        self.peer_limit.load(Ordering::Acquire)
    }

    /// Open and below the server's concurrent stream limit.
    pub fn has_capacity(&self) -> bool {
        !self.is_closed() && self.in_flight() < self.peer_limit()
    }

    /// Issues one request; the response body streams as it arrives.
    ///
    /// The stream slot is held until the response body is fully read or dropped.
    pub async fn send(&self, request: Request<Body>) -> Result<Response<Body>> {
        if self.is_closed() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "HTTP/2 session closed",
            )));
        }
        let slot = StreamSlot::acquire(self.in_flight.clone());

        let (mut parts, body) = request.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(header::HOST);
        let end_of_stream = body.is_end_stream();

        let mut send = self.send.clone().ready().await.map_err(|e| self.fail(e))?;
        let (response, stream) = send
            .send_request(Request::from_parts(parts, ()), end_of_stream)
            .map_err(|e| self.fail(e))?;

        if !end_of_stream {
            tokio::spawn(async move {
                if let Err(e) = pipe_request_body(body, stream).await {
                    tracing::debug!(error = %e, "HTTP/2 request body aborted");
                }
            });
        }

        let response = response.await.map_err(|e| self.fail(e))?;
        let (parts, recv) = response.into_parts();
        let (tx, body) = Body::channel();
        tokio::spawn(async move {
            let _slot = slot;
            pump_response_body(recv, tx).await;
        });

        Ok(Response::from_parts(parts, body))
    }

    /// Both handles point at the same connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }

    fn fail(&self, err: h2::Error) -> Error {
        if err.is_go_away() || err.is_io() {
            self.closed.store(true, Ordering::Release);
        }
        Error::H2(err)
    }
}

/// Counts a stream against the session limit for as long as it lives.
struct StreamSlot(Arc<AtomicUsize>);

impl StreamSlot {
    fn acquire(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for StreamSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn pipe_request_body(mut body: Body, mut stream: SendStream<Bytes>) -> Result<()> {
    while let Some(chunk) = body.data().await {
        let mut chunk = chunk?;
        while !chunk.is_empty() {
            stream.reserve_capacity(chunk.len());
            let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
                Some(granted) => granted?,
                None => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "HTTP/2 stream closed while sending body",
                    )))
                }
            };
            if granted == 0 {
                continue;
            }
            let part = chunk.split_to(granted.min(chunk.len()));
            stream.send_data(part, false)?;
        }
    }

    match body.trailers().await? {
        Some(trailers) => stream.send_trailers(trailers)?,
        None => stream.send_data(Bytes::new(), true)?,
    }
    Ok(())
}

async fn pump_response_body(mut recv: RecvStream, mut tx: Sender) {
    while let Some(chunk) = recv.data().await {
        match chunk {
            Ok(bytes) => {
                let _ = recv.flow_control().release_capacity(bytes.len());
                if tx.send_data(bytes).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "HTTP/2 response body failed");
                tx.abort();
                return;
            }
        }
    }

    if let Ok(Some(trailers)) = recv.trailers().await {
        let _ = tx.send_trailers(trailers).await;
    }
}
