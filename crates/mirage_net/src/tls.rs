use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use boring::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use boring::x509::X509;
use dashmap::DashMap;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintProfile, ProfileId};
use crate::proxy::{open_tcp, UpstreamProxy};
use crate::transport::{join_host_port, BoxedStream};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Application protocol agreed during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    H2,
    Http1,
    /// Server ignored ALPN; treated as HTTP/1.1.
    None,
}

impl Alpn {
    /// Anything outside `{h2, http/1.1, <none>}` is refused.
    pub fn from_negotiated(proto: Option<&[u8]>) -> Result<Self> {
        match proto {
            None | Some(b"") => Ok(Self::None),
            Some(b"h2") => Ok(Self::H2),
            Some(b"http/1.1") => Ok(Self::Http1),
            Some(other) => Err(Error::UnsupportedProtocol(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::H2 => "h2",
            Self::Http1 => "http/1.1",
            Self::None => "",
        }
    }
}

impl fmt::Display for Alpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finished handshake: the encrypted stream plus what it negotiated.
#[derive(Debug)]
pub struct Connection {
    pub stream: BoxedStream,
    pub alpn: Alpn,
}

/// Opens a TLS connection whose ClientHello looks like `profile`.
///
/// Implementations never retry. The router only depends on this trait so it
/// can run over in-memory connections.
#[async_trait]
pub trait TlsDialer: Send + Sync {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        profile: &'static FingerprintProfile,
    ) -> Result<Connection>;
}

/// BoringSSL-backed dialer. One `SslConnector` is built per profile and reused.
pub struct BoringDialer {
    upstream: Option<UpstreamProxy>,
    handshake_timeout: Duration,
    accept_invalid_certs: bool,
    root_certs: Vec<Vec<u8>>,
    connectors: DashMap<ProfileId, SslConnector>,
}

impl Default for BoringDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl BoringDialer {
    pub fn new() -> Self {
        Self {
            upstream: None,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            accept_invalid_certs: false,
            root_certs: Vec::new(),
            connectors: DashMap::new(),
        }
    }

    /// Chain the TCP leg through an HTTP proxy.
    pub fn with_upstream(mut self, upstream: Option<UpstreamProxy>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Skip chain and hostname verification.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Extra trust anchors, DER or PEM.
    pub fn with_root_certificates(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.root_certs = certs;
        self
    }

    fn connector(&self, profile: &FingerprintProfile) -> Result<SslConnector> {
        if let Some(cached) = self.connectors.get(&profile.id) {
            return Ok(cached.clone());
        }
        let connector = self
            .build_connector(profile)
            .map_err(|e| Error::handshake(profile.name, format!("configure {profile}: {e}")))?;
        self.connectors.insert(profile.id, connector.clone());
        Ok(connector)
    }

    fn build_connector(
        &self,
        profile: &FingerprintProfile,
    ) -> std::result::Result<SslConnector, boring::error::ErrorStack> {
        let hello = &profile.hello;
        let mut builder = SslConnector::builder(SslMethod::tls_client())?;

        for cert in &self.root_certs {
            let parsed = X509::from_der(cert).or_else(|_| X509::from_pem(cert));
            match parsed {
                Ok(cert) => builder.cert_store_mut().add_cert(cert)?,
                Err(e) => tracing::warn!(error = %e, "ignoring unparsable root certificate"),
            }
        }

        builder.set_cipher_list(&hello.cipher_list.join(":"))?;
        builder.set_curves_list(&hello.curves.join(":"))?;
        builder.set_sigalgs_list(&hello.sigalgs.join(":"))?;
        builder.set_grease_enabled(hello.grease);
        builder.set_permute_extensions(hello.permute_extensions);
        if hello.ocsp_stapling {
            builder.enable_ocsp_stapling();
        }
        if hello.signed_cert_timestamps {
            builder.enable_signed_cert_timestamps();
        }
        builder.set_alpn_protos(&hello.alpn_wire())?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;

        if self.accept_invalid_certs {
            builder.set_verify(SslVerifyMode::NONE);
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl TlsDialer for BoringDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        profile: &'static FingerprintProfile,
    ) -> Result<Connection> {
        let addr = join_host_port(host, port);
        let tcp = open_tcp(self.upstream.as_ref(), host, port).await?;

        let mut config = self
            .connector(profile)?
            .configure()
            .map_err(|e| Error::handshake(&addr, e))?;
        if self.accept_invalid_certs {
            config.set_verify_hostname(false);
        }

        let tls = match timeout(self.handshake_timeout, tokio_boring::connect(config, host, tcp)).await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => return Err(Error::handshake(&addr, e)),
            Err(_) => {
                return Err(Error::HandshakeTimeout {
                    addr,
                    timeout: self.handshake_timeout,
                })
            }
        };

        let alpn = Alpn::from_negotiated(tls.ssl().selected_alpn_protocol())?;
        tracing::debug!(%addr, %profile, %alpn, "TLS handshake complete");

        Ok(Connection {
            stream: Box::new(tls),
            alpn,
        })
    }
}
