use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on the number of requests in one batch.
pub const MAX_BATCH: usize = 100;

/// A single page fetch as submitted over the API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Method to use, `GET` when unset or blank.
    pub fn method(&self) -> &str {
        match self.method.as_deref() {
            Some(m) if !m.trim().is_empty() => m,
            _ => "GET",
        }
    }
}

/// Outcome of one fetch. Transport failures are reported in `error`, never
/// as a failed call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub url: String,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl FetchResponse {
    pub fn failed(url: impl Into<String>, error: impl ToString, duration_ms: u64) -> Self {
        Self {
            url: url.into(),
            error: Some(error.to_string()),
            duration_ms,
            ..Self::default()
        }
    }

    /// No error and a 2xx or 3xx status.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..400).contains(&self.status_code)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<FetchRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<FetchResponse>,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

impl BatchResponse {
    /// Tallies `results`, keeping their order.
    pub fn from_results(results: Vec<FetchResponse>) -> Self {
        let success = results.iter().filter(|r| r.is_success()).count();
        Self {
            total: results.len(),
            failed: results.len() - success,
            success,
            results,
        }
    }
}

/// Public view of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintInfo {
    pub name: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintList {
    pub fingerprints: Vec<FingerprintInfo>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches one URL; never fails, errors land in the response.
    async fn fetch(&self, request: FetchRequest) -> FetchResponse;

    /// Fetches every request concurrently. Results keep the input order.
    async fn fetch_batch(&self, requests: Vec<FetchRequest>) -> BatchResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_request_accepts_minimal_json() {
        let request: FetchRequest = serde_json::from_str(r#"{"url":"https://example.com"}"#).unwrap();
        assert_eq!(request.url, "https://example.com");
        assert_eq!(request.method(), "GET");
        assert!(request.headers.is_empty());
        assert!(request.fingerprint.is_none());
    }

    #[test]
    fn response_json_omits_empty_error() {
        let response = FetchResponse {
            url: "https://example.com".into(),
            status_code: 200,
            body: "ok".into(),
            duration_ms: 12,
            ..Default::default()
        };
        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["status_code"], 200);
        assert_eq!(json["duration_ms"], 12);
    }

    #[test]
    fn success_requires_no_error_and_2xx_or_3xx() {
        let ok = |status| FetchResponse {
            status_code: status,
            ..Default::default()
        };
        assert!(ok(200).is_success());
        assert!(ok(302).is_success());
        assert!(!ok(404).is_success());
        assert!(!ok(199).is_success());
        assert!(!FetchResponse::failed("u", "boom", 1).is_success());
    }

    #[test]
    fn batch_tally_adds_up() {
        let results = vec![
            FetchResponse {
                status_code: 200,
                ..Default::default()
            },
            FetchResponse {
                status_code: 500,
                ..Default::default()
            },
            FetchResponse::failed("u", "dial", 3),
        ];
        let batch = BatchResponse::from_results(results);
        assert_eq!(batch.total, 3);
        assert_eq!(batch.success, 1);
        assert_eq!(batch.failed, 2);
    }
}
