//! Analysis backend interface.
//!
//! The chat core only talks to the backend through [`ChatBackend`]; the
//! production implementation is [`HttpBackend`]. Address syntax checks are an
//! external collaborator behind [`AddressValidator`].

mod http;
mod types;
mod validate;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::{Error, TransportError};

pub use self::http::HttpBackend;
pub use self::types::{
    AccountSummary, AddressValidation, FallbackAnswer, FallbackRequest, JobState,
    JobStatusReport, PersistedMessage, ScanRequest, ScanSubmission, ScanType, SessionInit,
    StreamRequest,
};
pub use self::validate::TonAddressValidator;

/// Raw body chunks of a streamed answer.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Everything the chat core needs from the backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn submit_scan(&self, request: &ScanRequest) -> Result<ScanSubmission, Error>;

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusReport, Error>;

    async fn cancel_job(&self, job_id: &str) -> Result<(), Error>;

    /// Fails with [`crate::error::BackendError::Reported`] when the backend
    /// answers with an `{error}` payload.
    async fn get_account_summary(&self, address: &str) -> Result<AccountSummary, Error>;

    async fn init_session(&self, init: &SessionInit) -> Result<(), Error>;

    async fn append_message(
        &self,
        session_id: &str,
        message: &PersistedMessage,
    ) -> Result<(), Error>;

    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, Error>;

    async fn send_chat_fallback(&self, request: &FallbackRequest) -> Result<FallbackAnswer, Error>;
}

/// Address syntax and name resolution collaborator.
#[async_trait]
pub trait AddressValidator: Send + Sync {
    async fn validate_address(&self, raw: &str) -> AddressValidation;
}
