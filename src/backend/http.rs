//! HTTP implementation of [`ChatBackend`].

use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::{
    AccountSummary, ByteStream, ChatBackend, FallbackAnswer, FallbackRequest, JobStatusReport,
    PersistedMessage, ScanRequest, ScanSubmission, SessionInit, StreamRequest,
};
use crate::config::ApiConfig;
use crate::error::{BackendError, Error, TransportError};

/// Typed client for the analysis backend's REST + streaming API.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &ApiConfig) -> Result<Self, Error> {
        // No overall timeout on the client: streamed answers may run for
        // minutes. Plain requests set their own timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| TransportError::Request {
                endpoint: config.base_url.clone(),
                reason: format!("HTTP client init failed: {e}"),
            })?;
        Ok(Self::with_client(client, &config.base_url, config.timeout))
    }

    /// Build from an existing `reqwest::Client` (shared in tests).
    pub fn with_client(client: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        let response = self
            .client
            .get(self.url(path))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| request_error(path, &e))?;
        parse_response(path, response).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(path, &e))?;
        parse_response(path, response).await
    }

    async fn post_ack<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), Error> {
        let response = self
            .client
            .post(self.url(path))
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(path, &e))?;
        ensure_success(path, response).await.map(|_| ())
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn submit_scan(&self, request: &ScanRequest) -> Result<ScanSubmission, Error> {
        self.post_json("/generate", request).await
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusReport, Error> {
        self.get_json(&format!("/status/{}", urlencoding::encode(job_id)))
            .await
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), Error> {
        let path = format!("/cancel/{}", urlencoding::encode(job_id));
        self.post_ack(&path, &serde_json::json!({})).await
    }

    async fn get_account_summary(&self, address: &str) -> Result<AccountSummary, Error> {
        let path = format!("/account/{}", urlencoding::encode(address));
        let value: serde_json::Value = self.get_json(&path).await?;
        parse_account_summary(&path, value)
    }

    async fn init_session(&self, init: &SessionInit) -> Result<(), Error> {
        self.post_ack("/chats", init).await
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: &PersistedMessage,
    ) -> Result<(), Error> {
        let path = format!("/chats/{}/messages", urlencoding::encode(session_id));
        self.post_ack(&path, message).await
    }

    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, Error> {
        let path = "/chat/stream";
        let response = self
            .client
            .post(self.url(path))
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| request_error(path, &e))?;
        let response = ensure_success(path, response).await?;

        let stream = response.bytes_stream().map(|chunk| {
            chunk.map_err(|e| TransportError::Stream {
                reason: e.to_string(),
            })
        });
        Ok(Box::pin(stream))
    }

    async fn send_chat_fallback(&self, request: &FallbackRequest) -> Result<FallbackAnswer, Error> {
        self.post_json("/chat", request).await
    }
}

fn request_error(endpoint: &str, error: &reqwest::Error) -> Error {
    let mut reason = error.to_string();
    if error.is_timeout() {
        reason = format!("timed out: {reason}");
    } else if let Some(source) = error.source() {
        reason = format!("{reason} ({source})");
    }
    Error::Transport(TransportError::Request {
        endpoint: endpoint.to_string(),
        reason,
    })
}

async fn ensure_success(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Transport(TransportError::Status {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    }))
}

async fn parse_response<T: DeserializeOwned>(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<T, Error> {
    let response = ensure_success(endpoint, response).await?;
    let bytes = response
        .bytes()
        .await
        .map_err(|e| request_error(endpoint, &e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        Error::Transport(TransportError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    })
}

/// The summary endpoint answers either with the summary or `{"error": ...}`.
fn parse_account_summary(endpoint: &str, value: serde_json::Value) -> Result<AccountSummary, Error> {
    if let Some(message) = value.get("error").and_then(|v| v.as_str()) {
        return Err(Error::Backend(BackendError::Reported {
            message: message.to_string(),
        }));
    }
    if value.get("address").is_none() {
        return Err(Error::Backend(BackendError::MissingField {
            endpoint: endpoint.to_string(),
            field: "address".to_string(),
        }));
    }
    serde_json::from_value(value).map_err(|e| {
        Error::Transport(TransportError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let backend = HttpBackend::with_client(
            reqwest::Client::new(),
            "http://localhost:8000/",
            Duration::from_secs(5),
        );
        assert_eq!(backend.base_url(), "http://localhost:8000");
        assert_eq!(backend.url("/status/a"), "http://localhost:8000/api/status/a");
    }

    #[test]
    fn summary_error_payload_is_a_backend_error() {
        let err = parse_account_summary(
            "/account/EQ",
            serde_json::json!({"error": "Account not found"}),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Backend(BackendError::Reported { ref message }) if message == "Account not found"
        ));
    }

    #[test]
    fn summary_without_address_is_rejected() {
        let err = parse_account_summary("/account/EQ", serde_json::json!({"balance": 1})).unwrap_err();
        assert!(matches!(err, Error::Backend(BackendError::MissingField { .. })));
    }

    #[test]
    fn summary_parses_full_payload() {
        let summary = parse_account_summary(
            "/account/EQ",
            serde_json::json!({
                "address": "EQabc",
                "status": "active",
                "is_wallet": true,
                "interfaces": ["wallet_v4r2"],
                "last_activity": 1700000000,
                "balance": 5000000000u64,
                "is_scam": false
            }),
        )
        .unwrap();
        assert_eq!(summary.address, "EQabc");
        assert_eq!(summary.balance, Some(5_000_000_000));
        assert_eq!(summary.interfaces, vec!["wallet_v4r2".to_string()]);
    }
}
