//! Scripted backend for controller tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::backend::{
    AccountSummary, AddressValidation, AddressValidator, ByteStream, ChatBackend, FallbackAnswer, FallbackRequest, JobState,
    JobStatusReport, PersistedMessage, ScanRequest, ScanSubmission, SessionInit, StreamRequest,
    TonAddressValidator,
};
use crate::chat::{ChatSession, ChatSettings};
use crate::error::{Error, TransportError};
use crate::session::SessionIdentity;

pub(crate) const FRIENDLY: &str = "EQCD39VS5jcptHL8vMjEXrzGaRcCVYto7HUn4bpAOg8xqB2N";
pub(crate) const OTHER: &str = "UQBvW8Z5huBkMJYdnfAEM5JqTNkuWX3diqYENkWsIL0XggGG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum StreamEnd {
    #[default]
    Close,
    Hang,
    Fail,
}

#[derive(Default)]
struct MockState {
    summaries: VecDeque<Result<AccountSummary, String>>,
    summary_calls: usize,
    submits: Vec<ScanRequest>,
    fail_submit: bool,
    submit_delay: Option<std::time::Duration>,
    statuses: HashMap<String, VecDeque<JobStatusReport>>,
    failing_status: HashSet<String>,
    status_calls: HashMap<String, usize>,
    cancelled: Vec<String>,
    inits: Vec<SessionInit>,
    appended: Vec<(String, PersistedMessage)>,
    stream_chunks: Vec<Vec<u8>>,
    stream_end: StreamEnd,
    fail_open: bool,
    stream_requests: Vec<StreamRequest>,
    fallback: Option<Result<FallbackAnswer, String>>,
    fallback_requests: Vec<FallbackRequest>,
}

/// In-memory [`ChatBackend`] driven by per-test scripts.
#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

fn transport(endpoint: &str, reason: &str) -> Error {
    Error::Transport(TransportError::Request {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    })
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Replace the summary script with a single answer repeated forever.
    pub(crate) fn set_summary(&self, result: Result<AccountSummary, String>) {
        let mut state = self.lock();
        state.summaries.clear();
        state.summaries.push_back(result);
    }

    /// Answers consumed one per call; the last one repeats.
    pub(crate) fn script_summaries(&self, results: Vec<Result<AccountSummary, String>>) {
        self.lock().summaries = results.into();
    }

    pub(crate) fn summary_calls(&self) -> usize {
        self.lock().summary_calls
    }

    pub(crate) fn fail_submit(&self) {
        self.lock().fail_submit = true;
    }

    /// Hold every submission for `delay` before answering.
    pub(crate) fn delay_submit(&self, delay: std::time::Duration) {
        self.lock().submit_delay = Some(delay);
    }

    pub(crate) fn submit_calls(&self) -> usize {
        self.lock().submits.len()
    }

    pub(crate) fn submits(&self) -> Vec<ScanRequest> {
        self.lock().submits.clone()
    }

    /// Statuses consumed one per poll; the last one repeats.
    pub(crate) fn push_statuses(
        &self,
        job_id: &str,
        reports: impl IntoIterator<Item = JobStatusReport>,
    ) {
        self.lock()
            .statuses
            .entry(job_id.to_string())
            .or_default()
            .extend(reports);
    }

    pub(crate) fn fail_status(&self, job_id: &str) {
        self.lock().failing_status.insert(job_id.to_string());
    }

    pub(crate) fn status_calls(&self, job_id: &str) -> usize {
        self.lock().status_calls.get(job_id).copied().unwrap_or(0)
    }

    pub(crate) fn cancelled_jobs(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    pub(crate) fn inits(&self) -> Vec<SessionInit> {
        self.lock().inits.clone()
    }

    pub(crate) fn appended(&self) -> Vec<(String, PersistedMessage)> {
        self.lock().appended.clone()
    }

    pub(crate) fn set_stream_chunks(&self, chunks: Vec<Vec<u8>>) {
        self.lock().stream_chunks = chunks;
    }

    pub(crate) fn set_stream_end(&self, end: StreamEnd) {
        self.lock().stream_end = end;
    }

    pub(crate) fn fail_open(&self) {
        self.lock().fail_open = true;
    }

    pub(crate) fn stream_requests(&self) -> Vec<StreamRequest> {
        self.lock().stream_requests.clone()
    }

    pub(crate) fn set_fallback(&self, result: Result<FallbackAnswer, String>) {
        self.lock().fallback = Some(result);
    }

    pub(crate) fn fallback_requests(&self) -> Vec<FallbackRequest> {
        self.lock().fallback_requests.clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn submit_scan(&self, request: &ScanRequest) -> Result<ScanSubmission, Error> {
        let delay = self.lock().submit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.submits.push(request.clone());
        if state.fail_submit {
            return Err(transport("/generate", "connection refused"));
        }
        Ok(ScanSubmission {
            job_id: format!("job-{}", state.submits.len()),
        })
    }

    async fn get_job_status(&self, job_id: &str) -> Result<JobStatusReport, Error> {
        let mut state = self.lock();
        *state.status_calls.entry(job_id.to_string()).or_default() += 1;
        if state.failing_status.contains(job_id) {
            return Err(transport("/status", "connection reset"));
        }
        let queue = state.statuses.entry(job_id.to_string()).or_default();
        let report = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(report.unwrap_or_else(|| JobStatusReport::new(JobState::Queued, 0)))
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), Error> {
        self.lock().cancelled.push(job_id.to_string());
        Ok(())
    }

    async fn get_account_summary(&self, address: &str) -> Result<AccountSummary, Error> {
        let mut state = self.lock();
        state.summary_calls += 1;
        let next = if state.summaries.len() > 1 {
            state.summaries.pop_front()
        } else {
            state.summaries.front().cloned()
        };
        match next {
            Some(Ok(summary)) => Ok(summary),
            Some(Err(reason)) => Err(transport("/account", &reason)),
            None => Ok(AccountSummary {
                address: address.to_string(),
                ..Default::default()
            }),
        }
    }

    async fn init_session(&self, init: &SessionInit) -> Result<(), Error> {
        self.lock().inits.push(init.clone());
        Ok(())
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: &PersistedMessage,
    ) -> Result<(), Error> {
        self.lock()
            .appended
            .push((session_id.to_string(), message.clone()));
        Ok(())
    }

    async fn open_stream(&self, request: &StreamRequest) -> Result<ByteStream, Error> {
        let mut state = self.lock();
        state.stream_requests.push(request.clone());
        if state.fail_open {
            return Err(Error::Transport(TransportError::Status {
                endpoint: "/chat/stream".to_string(),
                status: 502,
                body: "bad gateway".to_string(),
            }));
        }

        let chunks: Vec<Result<Bytes, TransportError>> = state
            .stream_chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.clone())))
            .collect();
        let body = futures::stream::iter(chunks);
        let stream: ByteStream = match state.stream_end {
            StreamEnd::Close => body.boxed(),
            StreamEnd::Hang => body.chain(futures::stream::pending()).boxed(),
            StreamEnd::Fail => body
                .chain(futures::stream::once(async {
                    Err(TransportError::Stream {
                        reason: "connection reset".to_string(),
                    })
                }))
                .boxed(),
        };
        Ok(stream)
    }

    async fn send_chat_fallback(&self, request: &FallbackRequest) -> Result<FallbackAnswer, Error> {
        let mut state = self.lock();
        state.fallback_requests.push(request.clone());
        match state.fallback.clone() {
            Some(Ok(answer)) => Ok(answer),
            Some(Err(reason)) => Err(transport("/chat", &reason)),
            None => Err(transport("/chat", "no fallback scripted")),
        }
    }
}

/// Syntax validator that counts how often it is consulted.
#[derive(Default)]
pub(crate) struct CountingValidator {
    calls: std::sync::atomic::AtomicUsize,
}

impl CountingValidator {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressValidator for CountingValidator {
    async fn validate_address(&self, raw: &str) -> AddressValidation {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        TonAddressValidator::check(raw)
    }
}

pub(crate) fn chat_with(backend: &MockBackend) -> ChatSession {
    ChatSession::new(
        Arc::new(backend.clone()),
        Arc::new(TonAddressValidator),
        SessionIdentity::ephemeral(),
        ChatSettings::default(),
    )
}

/// Let spawned tasks run without advancing the clock.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
