//! Conversation controller.
//!
//! A [`ChatSession`] owns one conversation: the [`Timeline`], the
//! [`Session`] state and the async drivers that write into them (account
//! bootstrap, scan polling and answer streaming). All shared state sits
//! behind one mutex; async steps re-check that they are still current while
//! holding it, immediately before mutating anything.

mod address;
mod frame;
mod persist;
mod scan;
mod stream;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{AddressValidator, ChatBackend, ScanType};
use crate::config::Config;
use crate::error::ValidationError;
use crate::retry::RetryPolicy;
use crate::session::{BootstrapPhase, BoundJob, PendingLimit, Session, SessionIdentity};
use crate::timeline::{Message, Timeline, TimelineEvent};

use self::persist::Persistence;

pub use self::address::{BootstrapOutcome, BootstrapSource, SkipReason};
pub use self::frame::{FrameDecoder, StreamFrame};
pub use self::stream::StreamOutcome;

/// Tunables for one conversation.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub user_id: String,
    pub retry: RetryPolicy,
    pub settle_delay: Duration,
    pub poll_interval: Duration,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_id: config.api.user_id.clone(),
            retry: RetryPolicy::from(&config.bootstrap),
            settle_delay: config.bootstrap.settle_delay,
            poll_interval: config.poller.interval,
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Answer stream currently being read.
#[derive(Debug)]
pub(crate) struct ActiveStream {
    cancel: CancellationToken,
    message_id: String,
}

#[derive(Debug, Default)]
pub(crate) struct ChatState {
    pub(crate) timeline: Timeline,
    pub(crate) session: Session,
    poll_task: Option<JoinHandle<()>>,
    stream: Option<ActiveStream>,
}

impl ChatState {
    /// Stop the poller and any open stream. Returns the job that was still
    /// running, if any.
    fn teardown(&mut self) -> Option<String> {
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
        self.stop_stream();
        self.session.clear_job()
    }

    /// Cancel the open stream and settle its placeholder. The reader sees
    /// the cancelled token and stops without touching the timeline again.
    fn stop_stream(&mut self) -> bool {
        let Some(active) = self.stream.take() else {
            return false;
        };
        active.cancel.cancel();
        self.session.activity.cancel_kind(crate::session::ActivityKind::Stream);
        self.session.stream_loading = false;

        let partial = self
            .timeline
            .get(&active.message_id)
            .map(|m| m.accumulated_text.clone())
            .unwrap_or_default();
        if partial.is_empty() {
            self.timeline.remove(&active.message_id);
        } else {
            self.timeline.update(&active.message_id, |m| stream::finalize(m, None));
        }
        true
    }
}

pub(crate) struct ChatInner {
    backend: Arc<dyn ChatBackend>,
    validator: Arc<dyn AddressValidator>,
    identity: SessionIdentity,
    settings: ChatSettings,
    persistence: Persistence,
    state: Mutex<ChatState>,
}

impl ChatInner {
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl Drop for ChatInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(job_id) = state.teardown() {
            self.persistence.cancel_job(&job_id);
        }
    }
}

/// Where user input was routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRoute {
    Ignored,
    Address(BootstrapOutcome),
    /// A limit reply started a scan; carries the job id on success.
    Scan(Option<String>),
    ScanTypeSelected(ScanType),
    Question(StreamOutcome),
    Hint,
}

/// Handle to one conversation. Cheap to clone.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<ChatInner>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        validator: Arc<dyn AddressValidator>,
        identity: SessionIdentity,
        settings: ChatSettings,
    ) -> Self {
        let persistence = Persistence::new(Arc::clone(&backend), settings.user_id.clone());
        Self {
            inner: Arc::new(ChatInner {
                backend,
                validator,
                identity,
                settings,
                persistence,
                state: Mutex::new(ChatState::default()),
            }),
        }
    }

    pub fn session_id(&self) -> String {
        self.inner.identity.ensure_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.inner.with_state(|s| s.timeline.subscribe())
    }

    /// Snapshot of the timeline.
    pub fn messages(&self) -> Vec<Message> {
        self.inner.with_state(|s| s.timeline.messages().to_vec())
    }

    pub fn is_loading(&self) -> bool {
        self.inner.with_state(|s| s.session.is_loading())
    }

    pub fn address(&self) -> Option<String> {
        self.inner.with_state(|s| s.session.address.clone())
    }

    pub fn bootstrap_phase(&self, address: &str) -> BootstrapPhase {
        self.inner.with_state(|s| s.session.phase(address))
    }

    pub fn bound_job(&self) -> Option<BoundJob> {
        self.inner.with_state(|s| s.session.bound_job.clone())
    }

    /// Job currently being polled.
    pub fn active_job(&self) -> Option<String> {
        self.inner.with_state(|s| s.session.job_id.clone())
    }

    pub fn pending_limit(&self) -> Option<PendingLimit> {
        self.inner.with_state(|s| s.session.pending_limit.clone())
    }

    /// Route one line of user input.
    pub async fn handle_user_input(&self, input: &str) -> InputRoute {
        let text = input.trim();
        if text.is_empty() {
            return InputRoute::Ignored;
        }

        if let Some(pending) = self.pending_limit() {
            match parse_limit(text) {
                Ok(Some(limit)) => {
                    self.note_user(text);
                    return InputRoute::Scan(
                        self.start_scan(&pending.address, pending.scan_type, limit)
                            .await,
                    );
                }
                Err(e) => {
                    self.note_user(text);
                    self.note_agent(format!("{e}. Reply with a positive number or \"all\"."));
                    return InputRoute::Hint;
                }
                Ok(None) => {}
            }
        }

        let validation = self.inner.validator.validate_address(text).await;
        if validation.is_valid {
            let outcome = self
                .bootstrap_validated(text, validation, BootstrapSource::Manual)
                .await;
            return InputRoute::Address(outcome);
        }

        if self.address().is_some()
            && let Some(scan_type) = ScanType::parse(text)
        {
            self.note_user(text);
            self.select_scan_type(scan_type);
            return InputRoute::ScanTypeSelected(scan_type);
        }

        if self.bound_job().is_some() {
            return InputRoute::Question(self.ask(text).await);
        }

        self.note_user(text);
        let hint = if self.address().is_some() {
            "Pick what to scan first: transactions, jettons or NFTs."
        } else {
            "Paste a TON address to get started."
        };
        self.note_agent(hint);
        InputRoute::Hint
    }

    /// Start a new conversation: stop background work, clear the timeline
    /// and mint a new id on next use.
    pub fn reset(&self) {
        let orphan = self.inner.with_state(|s| {
            let orphan = s.teardown();
            s.timeline.clear();
            s.session = Session::default();
            orphan
        });
        if let Some(job_id) = orphan {
            self.inner.persistence.cancel_job(&job_id);
        }
        self.inner.identity.reset();
        tracing::info!("Conversation reset");
    }

    /// Stop background work. The timeline stays readable.
    pub fn close(&self) {
        let orphan = self.inner.with_state(|s| {
            s.timeline.remove_transient();
            s.teardown()
        });
        if let Some(job_id) = orphan {
            self.inner.persistence.cancel_job(&job_id);
        }
    }

    fn note_user(&self, text: &str) {
        self.inner
            .with_state(|s| s.timeline.upsert(Message::user(text)));
    }

    fn note_agent(&self, text: impl Into<String>) {
        self.inner
            .with_state(|s| s.timeline.upsert(Message::agent(text).system()));
    }
}

/// `Ok(None)` means the input is not a limit reply at all.
fn parse_limit(text: &str) -> Result<Option<Option<u32>>, ValidationError> {
    if text.eq_ignore_ascii_case("all") {
        return Ok(Some(None));
    }
    if !text.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    match text.parse::<u32>() {
        Ok(n) if n > 0 => Ok(Some(Some(n))),
        _ => Err(ValidationError::InvalidLimit {
            input: text.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::backend::{AccountSummary, JobState, JobStatusReport};
    use crate::timeline::Role;

    #[test]
    fn limit_replies() {
        assert!(matches!(parse_limit("all"), Ok(Some(None))));
        assert!(matches!(parse_limit("250"), Ok(Some(Some(250)))));
        assert!(matches!(parse_limit("what happened?"), Ok(None)));
        assert!(parse_limit("0").is_err());
        assert!(parse_limit("99999999999").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn input_routes_address_then_scan_then_question() {
        let backend = MockBackend::new();
        backend.set_summary(Ok(AccountSummary {
            address: FRIENDLY.to_string(),
            balance: Some(1_000_000_000),
            ..Default::default()
        }));
        backend.push_statuses("job-1", [JobStatusReport::new(JobState::Success, 7)]);
        backend.set_stream_chunks(vec![
            b"data: {\"type\":\"token\",\"content\":\"Seven\"}\n".to_vec(),
            b"data: {\"type\":\"done\"}\n".to_vec(),
        ]);
        let chat = chat_with(&backend);

        let routed = chat.handle_user_input(FRIENDLY).await;
        assert_eq!(routed, InputRoute::Address(BootstrapOutcome::Completed));

        let routed = chat.handle_user_input("jettons").await;
        assert_eq!(routed, InputRoute::ScanTypeSelected(ScanType::Jettons));
        assert!(chat.pending_limit().is_some());

        let routed = chat.handle_user_input("all").await;
        assert_eq!(routed, InputRoute::Scan(Some("job-1".to_string())));
        settle().await;
        assert_eq!(chat.bound_job().map(|j| j.scan_type), Some(ScanType::Jettons));

        let routed = chat.handle_user_input("how many transfers?").await;
        assert!(matches!(routed, InputRoute::Question(StreamOutcome::Completed { .. })));
        let last = chat.messages().last().cloned().unwrap();
        assert_eq!(last.role, Role::Agent);
        assert_eq!(last.text(), Some("Seven"));
    }

    #[tokio::test(start_paused = true)]
    async fn pasted_address_is_validated_once() {
        let backend = MockBackend::new();
        let validator = Arc::new(CountingValidator::default());
        let chat = ChatSession::new(
            Arc::new(backend.clone()),
            validator.clone(),
            SessionIdentity::ephemeral(),
            ChatSettings::default(),
        );

        let routed = chat.handle_user_input(FRIENDLY).await;
        assert_eq!(routed, InputRoute::Address(BootstrapOutcome::Completed));
        assert_eq!(validator.calls(), 1);
        assert_eq!(chat.address().as_deref(), Some(FRIENDLY));
    }

    #[tokio::test(start_paused = true)]
    async fn free_text_without_address_gets_a_hint() {
        let backend = MockBackend::new();
        let chat = chat_with(&backend);

        assert_eq!(chat.handle_user_input("   ").await, InputRoute::Ignored);
        assert_eq!(chat.handle_user_input("hello").await, InputRoute::Hint);

        let messages = chat.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text(), Some("Paste a TON address to get started."));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_limit_is_reported_once() {
        let backend = MockBackend::new();
        let chat = chat_with(&backend);
        chat.handle_address_received(FRIENDLY, BootstrapSource::Manual)
            .await;
        chat.select_scan_type(ScanType::Transactions);
        let before = chat.messages().len();

        assert_eq!(chat.handle_user_input("0").await, InputRoute::Hint);
        let messages = chat.messages();
        assert_eq!(messages.len(), before + 2);
        assert!(messages[before + 1].text().unwrap().contains("not a valid item limit"));
        assert_eq!(backend.submit_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_starts_a_new_conversation() {
        let backend = MockBackend::new();
        backend.push_statuses("job-1", [JobStatusReport::new(JobState::Processing, 1)]);
        let chat = chat_with(&backend);

        let first_id = chat.session_id();
        chat.start_scan(FRIENDLY, ScanType::Transactions, None).await;
        assert!(chat.active_job().is_some());

        chat.reset();
        settle().await;

        assert!(chat.messages().is_empty());
        assert!(chat.active_job().is_none());
        assert!(!chat.is_loading());
        assert_ne!(chat.session_id(), first_id);
        assert_eq!(backend.cancelled_jobs(), vec!["job-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_last_handle_cancels_the_running_job() {
        let backend = MockBackend::new();
        backend.push_statuses("job-1", [JobStatusReport::new(JobState::Queued, 0)]);
        let chat = chat_with(&backend);
        chat.start_scan(FRIENDLY, ScanType::Nfts, Some(10)).await;
        settle().await;

        drop(chat);
        settle().await;

        assert_eq!(backend.cancelled_jobs(), vec!["job-1".to_string()]);
        let polls = backend.status_calls("job-1");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(backend.status_calls("job-1"), polls);
    }
}
