use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Browser identity a profile impersonates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileId {
    Chrome,
    Firefox,
    Safari,
}

/// ClientHello shape. Field order follows what a JA3 hash reads.
///
/// TLS 1.3 suites are not configurable in BoringSSL and always go out as
/// AES128-GCM, AES256-GCM, CHACHA20, which matches all three browsers.
#[derive(Debug, Clone, Copy)]
pub struct HelloTemplate {
    /// TLS 1.2 cipher suites in wire order (OpenSSL names).
    pub cipher_list: &'static [&'static str],
    /// supported_groups in wire order.
    pub curves: &'static [&'static str],
    /// signature_algorithms in wire order.
    pub sigalgs: &'static [&'static str],
    /// ALPN offer list, most preferred first.
    pub alpn: &'static [&'static str],
    /// Inject GREASE values into ciphers, groups and extensions.
    pub grease: bool,
    /// Shuffle extension order per connection (Chrome 110+, Firefox 135+).
    pub permute_extensions: bool,
    /// Send status_request (OCSP stapling).
    pub ocsp_stapling: bool,
    /// Send signed_certificate_timestamp.
    pub signed_cert_timestamps: bool,
}

impl HelloTemplate {
    /// ALPN list in the length-prefixed wire encoding.
    pub fn alpn_wire(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for proto in self.alpn {
            out.push(proto.len() as u8);
            out.extend_from_slice(proto.as_bytes());
        }
        out
    }
}

/// HTTP/2 SETTINGS and connection window sent right after the preface.
#[derive(Debug, Clone, Copy)]
pub struct Http2Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub initial_connection_window_size: u32,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

/// One immutable entry of the catalog.
#[derive(Debug)]
pub struct FingerprintProfile {
    pub id: ProfileId,
    pub name: &'static str,
    pub user_agent: &'static str,
    pub hello: HelloTemplate,
    pub http2: Http2Settings,
    /// Headers a real navigation from this browser carries, in send order.
    pub default_headers: &'static [(&'static str, &'static str)],
}

impl fmt::Display for FingerprintProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const FIREFOX_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0";
const SAFARI_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Mobile/15E148 Safari/604.1";

static CATALOG: [FingerprintProfile; 3] = [
    FingerprintProfile {
        id: ProfileId::Chrome,
        name: "Chrome",
        user_agent: CHROME_UA,
        hello: HelloTemplate {
            cipher_list: &[
                "ECDHE-ECDSA-AES128-GCM-SHA256",
                "ECDHE-RSA-AES128-GCM-SHA256",
                "ECDHE-ECDSA-AES256-GCM-SHA384",
                "ECDHE-RSA-AES256-GCM-SHA384",
                "ECDHE-ECDSA-CHACHA20-POLY1305",
                "ECDHE-RSA-CHACHA20-POLY1305",
                "ECDHE-RSA-AES128-SHA",
                "ECDHE-RSA-AES256-SHA",
                "AES128-GCM-SHA256",
                "AES256-GCM-SHA384",
                "AES128-SHA",
                "AES256-SHA",
            ],
            curves: &["X25519", "P-256", "P-384"],
            sigalgs: &[
                "ecdsa_secp256r1_sha256",
                "rsa_pss_rsae_sha256",
                "rsa_pkcs1_sha256",
                "ecdsa_secp384r1_sha384",
                "rsa_pss_rsae_sha384",
                "rsa_pkcs1_sha384",
                "rsa_pss_rsae_sha512",
                "rsa_pkcs1_sha512",
            ],
            alpn: &["h2", "http/1.1"],
            grease: true,
            permute_extensions: true,
            ocsp_stapling: true,
            signed_cert_timestamps: true,
        },
        http2: Http2Settings {
            header_table_size: Some(65_536),
            enable_push: Some(false),
            max_concurrent_streams: None,
            initial_window_size: 6_291_456,
            initial_connection_window_size: 15_728_640,
            max_frame_size: None,
            max_header_list_size: Some(262_144),
        },
        default_headers: &[
            (
                "sec-ch-ua",
                r#""Chromium";v="120", "Google Chrome";v="120", "Not?A_Brand";v="99""#,
            ),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", r#""Windows""#),
            ("upgrade-insecure-requests", "1"),
            ("user-agent", CHROME_UA),
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8",
            ),
            ("sec-fetch-site", "none"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-user", "?1"),
            ("sec-fetch-dest", "document"),
            ("accept-encoding", "gzip, deflate, br"),
            ("accept-language", "en-US,en;q=0.9"),
        ],
    },
    FingerprintProfile {
        id: ProfileId::Firefox,
        name: "Firefox",
        user_agent: FIREFOX_UA,
        hello: HelloTemplate {
            cipher_list: &[
                "ECDHE-ECDSA-AES128-GCM-SHA256",
                "ECDHE-RSA-AES128-GCM-SHA256",
                "ECDHE-ECDSA-CHACHA20-POLY1305",
                "ECDHE-RSA-CHACHA20-POLY1305",
                "ECDHE-ECDSA-AES256-GCM-SHA384",
                "ECDHE-RSA-AES256-GCM-SHA384",
                "ECDHE-ECDSA-AES256-SHA",
                "ECDHE-ECDSA-AES128-SHA",
                "ECDHE-RSA-AES128-SHA",
                "ECDHE-RSA-AES256-SHA",
                "AES128-GCM-SHA256",
                "AES256-GCM-SHA384",
                "AES128-SHA",
                "AES256-SHA",
            ],
            curves: &["X25519", "P-256", "P-384", "P-521"],
            sigalgs: &[
                "ecdsa_secp256r1_sha256",
                "ecdsa_secp384r1_sha384",
                "ecdsa_secp521r1_sha512",
                "rsa_pss_rsae_sha256",
                "rsa_pss_rsae_sha384",
                "rsa_pss_rsae_sha512",
                "rsa_pkcs1_sha256",
                "rsa_pkcs1_sha384",
                "rsa_pkcs1_sha512",
            ],
            alpn: &["h2", "http/1.1"],
            grease: false,
            permute_extensions: false,
            ocsp_stapling: true,
            signed_cert_timestamps: false,
        },
        http2: Http2Settings {
            header_table_size: Some(65_536),
            enable_push: None,
            max_concurrent_streams: None,
            initial_window_size: 131_072,
            initial_connection_window_size: 12_582_912,
            max_frame_size: Some(16_384),
            max_header_list_size: None,
        },
        default_headers: &[
            ("user-agent", FIREFOX_UA),
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
            ("accept-language", "en-US,en;q=0.5"),
            ("accept-encoding", "gzip, deflate, br"),
            ("upgrade-insecure-requests", "1"),
            ("sec-fetch-dest", "document"),
            ("sec-fetch-mode", "navigate"),
            ("sec-fetch-site", "none"),
            ("sec-fetch-user", "?1"),
        ],
    },
    FingerprintProfile {
        id: ProfileId::Safari,
        name: "Safari",
        user_agent: SAFARI_UA,
        hello: HelloTemplate {
            cipher_list: &[
                "ECDHE-ECDSA-AES256-GCM-SHA384",
                "ECDHE-ECDSA-AES128-GCM-SHA256",
                "ECDHE-ECDSA-CHACHA20-POLY1305",
                "ECDHE-RSA-AES256-GCM-SHA384",
                "ECDHE-RSA-AES128-GCM-SHA256",
                "ECDHE-RSA-CHACHA20-POLY1305",
                "ECDHE-ECDSA-AES256-SHA",
                "ECDHE-ECDSA-AES128-SHA",
                "ECDHE-RSA-AES256-SHA",
                "ECDHE-RSA-AES128-SHA",
                "AES256-GCM-SHA384",
                "AES128-GCM-SHA256",
                "AES256-SHA",
                "AES128-SHA",
            ],
            curves: &["X25519", "P-256", "P-384", "P-521"],
            sigalgs: &[
                "ecdsa_secp256r1_sha256",
                "rsa_pss_rsae_sha256",
                "rsa_pkcs1_sha256",
                "ecdsa_secp384r1_sha384",
                "rsa_pss_rsae_sha384",
                "rsa_pkcs1_sha384",
                "rsa_pss_rsae_sha512",
                "rsa_pkcs1_sha512",
            ],
            alpn: &["h2", "http/1.1"],
            grease: true,
            permute_extensions: false,
            ocsp_stapling: true,
            signed_cert_timestamps: true,
        },
        http2: Http2Settings {
            header_table_size: None,
            enable_push: Some(false),
            max_concurrent_streams: Some(100),
            initial_window_size: 2_097_152,
            initial_connection_window_size: 10_485_760,
            max_frame_size: None,
            max_header_list_size: None,
        },
        default_headers: &[
            (
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
            ("sec-fetch-site", "none"),
            ("accept-encoding", "gzip, deflate, br"),
            ("sec-fetch-mode", "navigate"),
            ("user-agent", SAFARI_UA),
            ("accept-language", "en-US,en;q=0.9"),
            ("sec-fetch-dest", "document"),
        ],
    },
];

/// All profiles, in catalog order.
pub fn list_profiles() -> &'static [FingerprintProfile] {
    &CATALOG
}

/// The deterministic default: always the first catalog entry.
pub fn select_default() -> &'static FingerprintProfile {
    &CATALOG[0]
}

/// Case-insensitive lookup. Unknown names fall back to [`select_default`].
pub fn select_by_name(name: &str) -> &'static FingerprintProfile {
    find(name).unwrap_or_else(select_default)
}

/// Case-insensitive lookup without the fallback.
pub fn find(name: &str) -> Option<&'static FingerprintProfile> {
    let name = name.trim();
    CATALOG.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// How a profile is chosen when the caller names none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Always the first catalog entry.
    #[default]
    First,
    /// Cycle through the catalog in order.
    RoundRobin,
    /// Uniform pick per call.
    Random,
}

impl std::str::FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "first" => Ok(Self::First),
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown selection policy: {other}")),
        }
    }
}

/// Picks profiles for requests that do not name one.
#[derive(Debug, Default)]
pub struct Selector {
    policy: SelectionPolicy,
    index: AtomicUsize,
}

impl Selector {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            policy,
            index: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn pick(&self) -> &'static FingerprintProfile {
        match self.policy {
            SelectionPolicy::First => select_default(),
            SelectionPolicy::RoundRobin => {
                let i = self.index.fetch_add(1, Ordering::Relaxed) % CATALOG.len();
                &CATALOG[i]
            }
            SelectionPolicy::Random => &CATALOG[rand::thread_rng().gen_range(0..CATALOG.len())],
        }
    }

    /// Named profile if given and known, otherwise whatever the policy picks.
    pub fn resolve(&self, name: Option<&str>) -> &'static FingerprintProfile {
        name.filter(|n| !n.trim().is_empty())
            .and_then(find)
            .unwrap_or_else(|| self.pick())
    }
}
