use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use mirage_net::fingerprint::{self, FingerprintProfile, SelectionPolicy};
use mirage_net::UpstreamProxy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Command line, with environment fallbacks for every flag.
#[derive(Parser, Debug)]
#[command(name = "mirage", version, about = "Browser-fingerprinted forward proxy and fetch API")]
pub struct Cli {
    /// Address the proxy and API listen on
    #[arg(short, long, env = "MIRAGE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Default fingerprint profile (chrome, firefox, safari)
    #[arg(short, long, env = "MIRAGE_FINGERPRINT", default_value = "chrome")]
    pub fingerprint: String,

    /// How API fetches without a fingerprint pick one: first, round_robin, random
    #[arg(long, env = "MIRAGE_SELECTION", default_value = "first")]
    pub selection: SelectionPolicy,

    /// Chain outbound connections through http://[user:pass@]host:port
    #[arg(long, env = "MIRAGE_UPSTREAM_PROXY")]
    pub upstream_proxy: Option<String>,

    /// Concurrent API fetches
    #[arg(short, long, env = "MIRAGE_WORKERS", default_value_t = 500)]
    pub workers: usize,

    /// Token expected in Proxy-Authorization
    #[arg(long, env = "MIRAGE_PROXY_TOKEN", hide_env_values = true)]
    pub proxy_token: Option<String>,

    /// Generate a random token when none is configured
    #[arg(long, env = "MIRAGE_GENERATE_TOKEN")]
    pub generate_token: bool,

    /// Response body cap for API fetches, in bytes
    #[arg(long, env = "MIRAGE_MAX_BODY_BYTES", default_value_t = 10 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Skip certificate verification on outbound TLS
    #[arg(long, env = "MIRAGE_ACCEPT_INVALID_CERTS")]
    pub accept_invalid_certs: bool,

    /// Reject relative URLs instead of serving the REST API
    #[arg(long, env = "MIRAGE_DISABLE_API")]
    pub disable_api: bool,

    #[arg(long, env = "MIRAGE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Write daily-rotated log files here instead of stdout
    #[arg(long, env = "MIRAGE_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    pub fingerprint: String,
    pub selection: SelectionPolicy,
    pub upstream_proxy: Option<String>,
    pub workers: usize,
    #[serde(skip_serializing)]
    pub proxy_token: Option<String>,
    pub generate_token: bool,
    pub max_body_bytes: usize,
    pub accept_invalid_certs: bool,
    pub api_enabled: bool,
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub batch_timeout_secs: u64,
    pub log_format: LogFormat,
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            fingerprint: "chrome".to_string(),
            selection: SelectionPolicy::First,
            upstream_proxy: None,
            workers: 500,
            proxy_token: None,
            generate_token: false,
            max_body_bytes: 10 * 1024 * 1024,
            accept_invalid_certs: false,
            api_enabled: true,
            connect_timeout_secs: 30,
            handshake_timeout_secs: 10,
            request_timeout_secs: 30,
            fetch_timeout_secs: 60,
            batch_timeout_secs: 300,
            log_format: LogFormat::Compact,
            log_dir: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen", &self.listen)
            .field("fingerprint", &self.fingerprint)
            .field("selection", &self.selection)
            .field("upstream_proxy", &self.upstream_proxy.is_some())
            .field("workers", &self.workers)
            .field("auth", &(self.proxy_token.is_some() || self.generate_token))
            .field("max_body_bytes", &self.max_body_bytes)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("api_enabled", &self.api_enabled)
            .finish_non_exhaustive()
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            listen: cli.listen,
            fingerprint: cli.fingerprint,
            selection: cli.selection,
            upstream_proxy: cli.upstream_proxy.filter(|u| !u.trim().is_empty()),
            workers: cli.workers,
            proxy_token: cli.proxy_token.filter(|t| !t.is_empty()),
            generate_token: cli.generate_token,
            max_body_bytes: cli.max_body_bytes,
            accept_invalid_certs: cli.accept_invalid_certs,
            api_enabled: !cli.disable_api,
            log_format: cli.log_format,
            log_dir: cli.log_dir,
            ..Self::default()
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        if self.max_body_bytes == 0 {
            bail!("body cap must be at least 1 byte");
        }
        if fingerprint::find(&self.fingerprint).is_none() {
            tracing::warn!(
                fingerprint = %self.fingerprint,
                fallback = %fingerprint::select_default(),
                "unknown fingerprint, using default"
            );
        }
        self.upstream()?;
        Ok(())
    }

    pub fn profile(&self) -> &'static FingerprintProfile {
        fingerprint::select_by_name(&self.fingerprint)
    }

    pub fn upstream(&self) -> Result<Option<UpstreamProxy>> {
        self.upstream_proxy
            .as_deref()
            .map(|raw| UpstreamProxy::parse(raw).context("invalid upstream proxy URL"))
            .transpose()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirage_net::fingerprint::ProfileId;

    #[test]
    fn cli_defaults_match_config_defaults() {
        let config = Config::from(Cli::parse_from(["mirage"]));
        let defaults = Config::default();
        assert_eq!(config.listen, defaults.listen);
        assert_eq!(config.workers, 500);
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);
        assert!(config.api_enabled);
        assert_eq!(config.profile().id, ProfileId::Chrome);
        config.validate().unwrap();
    }

    #[test]
    fn cli_flags_are_applied() {
        let config = Config::from(Cli::parse_from([
            "mirage",
            "--fingerprint",
            "FIREFOX",
            "--selection",
            "round_robin",
            "--workers",
            "8",
            "--upstream-proxy",
            "http://u:p@10.0.0.1:3128",
            "--disable-api",
        ]));
        assert_eq!(config.profile().id, ProfileId::Firefox);
        assert_eq!(config.selection, SelectionPolicy::RoundRobin);
        assert_eq!(config.workers, 8);
        assert!(!config.api_enabled);
        let upstream = config.upstream().unwrap().unwrap();
        assert_eq!(upstream.port(), 3128);
        assert!(upstream.has_credentials());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = Config {
            workers: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_upstream_is_rejected() {
        let config = Config {
            upstream_proxy: Some("socks5://127.0.0.1:1080".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"workers": 4, "fingerprint": "safari"}"#).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.profile().id, ProfileId::Safari);
        assert_eq!(config.fetch_timeout(), Duration::from_secs(60));
        assert_eq!(config.batch_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn debug_hides_token() {
        let config = Config {
            proxy_token: Some("sk_live_secret".into()),
            ..Config::default()
        };
        assert!(!format!("{config:?}").contains("sk_live_secret"));
    }
}
