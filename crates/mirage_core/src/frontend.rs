use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode, Version};
use hyper::upgrade::Upgraded;
use hyper::Body;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use mirage_net::headers::strip_hop_by_hop;
use mirage_net::proxy::open_tcp_authority;
use mirage_net::transport::{authority_with_default_port, BoxedStream};
use mirage_net::Error as NetError;

use crate::api;
use crate::state::AppState;

const NOT_A_PROXY_REQUEST: &str = "This is a proxy server. Send absolute URLs.";

/// Entry point for every request on the listener.
pub async fn handle(
    state: Arc<AppState>,
    peer: SocketAddr,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let is_connect = req.method() == Method::CONNECT;
    let is_absolute = req.uri().scheme().is_some() && req.uri().authority().is_some();

    if !is_connect && !is_absolute {
        if state.config.api_enabled {
            return Ok(api::handle(state, req).await);
        }
        return Ok(text(StatusCode::BAD_REQUEST, NOT_A_PROXY_REQUEST));
    }

    if let Some(auth) = &state.auth {
        if let Err(e) = auth.validate_proxy_auth(req.headers()) {
            debug!(%peer, reason = %e, "proxy auth rejected");
            return Ok(mod_auth::reject_407());
        }
    }

    if is_connect {
        Ok(connect(state, peer, req).await)
    } else {
        Ok(forward(state, peer, req).await)
    }
}

async fn connect(state: Arc<AppState>, peer: SocketAddr, req: Request<Body>) -> Response<Body> {
    let raw = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => req.uri().to_string(),
    };
    let target = match authority_with_default_port(&raw, 443) {
        Ok(target) => target,
        Err(e) => {
            debug!(%peer, target = %raw, error = %e, "bad CONNECT target");
            return text(StatusCode::BAD_REQUEST, "invalid CONNECT target");
        }
    };

    let dial = open_tcp_authority(state.upstream.as_ref(), &target, 443);
    let outbound = match tokio::time::timeout(state.config.connect_timeout(), dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(%peer, %target, error = %e, "CONNECT dial failed");
            return text(StatusCode::BAD_GATEWAY, "502 Bad Gateway");
        }
        Err(_) => {
            warn!(%peer, %target, "CONNECT dial timed out");
            return text(StatusCode::BAD_GATEWAY, "502 Bad Gateway");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => relay(upgraded, outbound, &target).await,
            Err(e) => warn!(%peer, %target, error = %e, "upgrade failed"),
        }
    });

    let mut response = Response::new(Body::empty());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Copies both directions until either one ends, then closes both sides.
async fn relay(upgraded: Upgraded, outbound: BoxedStream, target: &str) {
    let (mut client_read, mut client_write) = tokio::io::split(upgraded);
    let (mut target_read, mut target_write) = tokio::io::split(outbound);

    let (direction, result) = tokio::select! {
        r = tokio::io::copy(&mut client_read, &mut target_write) => ("client->target", r),
        r = tokio::io::copy(&mut target_read, &mut client_write) => ("target->client", r),
    };
    match result {
        Ok(bytes) => debug!(%target, direction, bytes, "tunnel closed"),
        Err(e) => debug!(%target, direction, error = %e, "tunnel closed with error"),
    }

    let _ = target_write.shutdown().await;
    let _ = client_write.shutdown().await;
}

async fn forward(state: Arc<AppState>, peer: SocketAddr, mut req: Request<Body>) -> Response<Body> {
    strip_hop_by_hop(req.headers_mut());
    let target = req.uri().to_string();
    let method = req.method().clone();

    let round_trip = state.router.round_trip(req);
    let result = match tokio::time::timeout(state.config.request_timeout(), round_trip).await {
        Ok(result) => result,
        Err(elapsed) => Err(NetError::from(elapsed)),
    };

    match result {
        Ok(mut response) => {
            strip_hop_by_hop(response.headers_mut());
            *response.version_mut() = Version::HTTP_11;
            info!(%peer, %method, %target, status = response.status().as_u16(), "forwarded");
            response
        }
        Err(NetError::RequestBuild(reason)) => {
            debug!(%peer, %target, %reason, "unforwardable request");
            text(StatusCode::BAD_REQUEST, &reason)
        }
        Err(e) => {
            warn!(%peer, %method, %target, error = %e, "forward failed");
            text(StatusCode::BAD_GATEWAY, "502 Bad Gateway")
        }
    }
}

fn text(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(format!("{body}\n")));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
