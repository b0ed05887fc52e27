use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Protocol-agnostic byte stream: raw TCP, TLS, an upstream tunnel or an
/// in-memory pipe all look the same to the wire handlers.
pub type BoxedStream = Box<dyn RawStream>;

pub trait RawStream: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + fmt::Debug> RawStream for T {}

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const KEEPALIVE: Duration = Duration::from_secs(30);

pub struct TransportBuilder;

impl TransportBuilder {
    /// Resolves `host:port` and connects to the first address that answers.
    ///
    /// Every attempt is bounded by [`CONNECT_TIMEOUT`]. The returned socket has
    /// Nagle disabled and TCP keepalive armed.
    pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
        let label = format!("{host}:{port}");
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| Error::dial(&label, format!("resolve: {e}")))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            tracing::trace!(%addr, "attempting TCP connect");
            match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    Self::tune(&stream)?;
                    return Ok(stream);
                }
                Ok(Err(e)) => last_err = Some(e.to_string()),
                Err(_) => last_err = Some(format!("timed out after {CONNECT_TIMEOUT:?}")),
            }
        }

        Err(Error::dial(
            label,
            last_err.unwrap_or_else(|| "no addresses resolved".to_string()),
        ))
    }

    fn tune(stream: &TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        Ok(())
    }

    pub fn into_boxed<S>(stream: S) -> BoxedStream
    where
        S: RawStream + 'static,
    {
        Box::new(stream)
    }
}

/// Splits `host[:port]` and applies `default_port` when the port is absent.
///
/// Bracketed IPv6 literals keep their brackets out of the host part.
pub fn split_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let authority = authority.trim();
    if authority.is_empty() {
        return Err(Error::request("empty host"));
    }

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| Error::request(format!("bad IPv6 authority: {authority}")))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p
                .parse()
                .map_err(|_| Error::request(format!("bad port in {authority}")))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| Error::request(format!("bad port in {authority}")))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((authority.to_string(), default_port)),
    }
}

/// `host:port` with the default port filled in; the pool and tunnel key.
pub fn authority_with_default_port(authority: &str, default_port: u16) -> Result<String> {
    let (host, port) = split_host_port(authority, default_port)?;
    Ok(join_host_port(&host, port))
}

pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
