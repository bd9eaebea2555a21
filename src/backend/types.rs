//! Wire types for the analysis backend.

use serde::{Deserialize, Serialize};

/// Kind of data a scan job gathers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    #[default]
    Transactions,
    Jettons,
    Nfts,
}

impl ScanType {
    pub const ALL: [ScanType; 3] = [Self::Transactions, Self::Jettons, Self::Nfts];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::Jettons => "jettons",
            Self::Nfts => "nfts",
        }
    }

    /// Human label used in chat text.
    pub fn label(self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::Jettons => "jettons",
            Self::Nfts => "NFTs",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "transactions" | "transaction" | "txs" | "tx" => Some(Self::Transactions),
            "jettons" | "jetton" | "tokens" => Some(Self::Jettons),
            "nfts" | "nft" => Some(Self::Nfts),
            _ => None,
        }
    }
}

/// Body of `POST /api/generate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanRequest {
    pub address: String,
    pub scan_type: ScanType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScanSubmission {
    pub job_id: String,
}

/// Lifecycle state of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Success,
    Empty,
    Error,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Processing)
    }
}

/// Response of `GET /api/status/{job_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub status: JobState,
    #[serde(default)]
    pub count: u64,
    #[serde(default, alias = "error_msg", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl JobStatusReport {
    pub fn new(status: JobState, count: u64) -> Self {
        Self {
            status,
            count,
            error: None,
            download_url: None,
        }
    }
}

/// Response of `GET /api/account/{address}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccountSummary {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub is_wallet: bool,
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Unix seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<i64>,
    /// Nano-units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<u64>,
    #[serde(default)]
    pub is_scam: bool,
}

/// Body of `POST /api/chats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInit {
    pub session_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

/// Body of `POST /api/chats/{session_id}/messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Body of `POST /api/chat/stream`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub job_id: String,
    pub question: String,
    pub session_id: String,
    pub user_id: String,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRequest {
    pub job_id: String,
    pub question: String,
}

/// Response of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackAnswer {
    #[serde(alias = "content")]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Result of an address syntax check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressValidation {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AddressValidation {
    pub fn valid(normalized: impl Into<String>) -> Self {
        Self {
            is_valid: true,
            normalized_address: Some(normalized.into()),
            error: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            normalized_address: None,
            error: Some(reason.into()),
        }
    }
}
