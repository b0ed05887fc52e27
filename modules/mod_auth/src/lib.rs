use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{Response, StatusCode};
use hyper::Body;
use rand::RngCore;
use zeroize::Zeroizing;

/// `Proxy-Authenticate` challenge sent with every 407.
pub const CHALLENGE: &str = r#"Basic realm="mirage""#;
const TOKEN_PREFIX: &str = "sk_live_";

/// Why a `Proxy-Authorization` header was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing Proxy-Authorization header")]
    Missing,
    #[error("unsupported authorization scheme")]
    UnsupportedScheme,
    #[error("malformed Basic credentials")]
    Malformed,
    #[error("invalid proxy token")]
    InvalidToken,
}

/// Single shared token checked against `Proxy-Authorization: Basic`.
///
/// Only the password half is compared; any username is accepted.
pub struct ProxyAuth {
    token: Zeroizing<String>,
}

impl ProxyAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
        }
    }

    /// Fresh random token: `sk_live_` followed by 32 random bytes in hex.
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut bytes[..]);
        let token = format!("{TOKEN_PREFIX}{}", hex::encode(&bytes[..]));
        tracing::info!("generated proxy token: {token}");
        Self::new(token)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn validate_proxy_auth(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let value = headers
            .get(PROXY_AUTHORIZATION)
            .ok_or(AuthError::Missing)?
            .to_str()
            .map_err(|_| AuthError::Malformed)?;
        self.validate(value)
    }

    /// Checks one raw header value.
    pub fn validate(&self, header: &str) -> Result<(), AuthError> {
        let encoded = header
            .strip_prefix("Basic ")
            .ok_or(AuthError::UnsupportedScheme)?;
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| AuthError::Malformed)?,
        );
        let colon = decoded
            .iter()
            .position(|&b| b == b':')
            .ok_or(AuthError::Malformed)?;

        if constant_time_eq(&decoded[colon + 1..], self.token.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `407 Proxy Authentication Required` with a Basic challenge.
pub fn reject_407() -> Response<Body> {
    let mut response = Response::new(Body::from("407 Proxy Authentication Required\r\n"));
    *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
    let headers = response.headers_mut();
    headers.insert(PROXY_AUTHENTICATE, HeaderValue::from_static(CHALLENGE));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic(credentials: &str) -> String {
        format!("Basic {}", STANDARD.encode(credentials))
    }

    #[test]
    fn any_username_with_right_token_passes() {
        let auth = ProxyAuth::new("T0k3n");
        assert_eq!(auth.validate(&basic("anyuser:T0k3n")), Ok(()));
        assert_eq!(auth.validate(&basic(":T0k3n")), Ok(()));
        assert_eq!(auth.validate(&basic("someone-else:T0k3n")), Ok(()));
    }

    #[test]
    fn everything_else_is_rejected() {
        let auth = ProxyAuth::new("T0k3n");
        assert_eq!(auth.validate(&basic("user:wrong")), Err(AuthError::InvalidToken));
        assert_eq!(auth.validate(&basic("user:T0k3n2")), Err(AuthError::InvalidToken));
        assert_eq!(auth.validate(&basic("T0k3n")), Err(AuthError::Malformed));
        assert_eq!(auth.validate("Basic !!!"), Err(AuthError::Malformed));
        assert_eq!(auth.validate("Bearer T0k3n"), Err(AuthError::UnsupportedScheme));
        assert_eq!(
            auth.validate_proxy_auth(&HeaderMap::new()),
            Err(AuthError::Missing)
        );
    }

    #[test]
    fn token_may_contain_colons() {
        let auth = ProxyAuth::new("a:b");
        assert_eq!(auth.validate(&basic("user:a:b")), Ok(()));
    }

    #[test]
    fn header_map_lookup() {
        let auth = ProxyAuth::new("T0k3n");
        let mut headers = HeaderMap::new();
        headers.insert(
            PROXY_AUTHORIZATION,
            HeaderValue::from_str(&basic("u:T0k3n")).unwrap(),
        );
        assert!(auth.validate_proxy_auth(&headers).is_ok());
    }

    #[test]
    fn generated_token_shape() {
        let auth = ProxyAuth::generate();
        let token = auth.token();
        assert!(token.starts_with("sk_live_"));
        assert_eq!(token.len(), "sk_live_".len() + 64);
        assert!(token["sk_live_".len()..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(ProxyAuth::generate().token(), token);
    }

    #[test]
    fn challenge_carries_realm() {
        let response = reject_407();
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            response.headers()[PROXY_AUTHENTICATE],
            r#"Basic realm="mirage""#
        );
    }
}
