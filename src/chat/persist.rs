//! Fire-and-forget writes to the backend's conversation store.
//!
//! Failures are logged and never touch in-memory state.

use std::future::Future;
use std::sync::Arc;

use crate::backend::{ChatBackend, PersistedMessage, SessionInit};
use crate::error::Error;
use crate::timeline::Role;

#[derive(Clone)]
pub(crate) struct Persistence {
    backend: Arc<dyn ChatBackend>,
    user_id: String,
}

impl Persistence {
    pub(crate) fn new(backend: Arc<dyn ChatBackend>, user_id: impl Into<String>) -> Self {
        Self {
            backend,
            user_id: user_id.into(),
        }
    }

    pub(crate) fn user_id(&self) -> &str {
        &self.user_id
    }

    pub(crate) fn init_session(
        &self,
        session_id: &str,
        title: Option<String>,
        address: Option<String>,
        job_id: Option<String>,
    ) {
        let backend = Arc::clone(&self.backend);
        let init = SessionInit {
            session_id: session_id.to_string(),
            user_id: self.user_id.clone(),
            title,
            address,
            job_id,
        };
        spawn_detached("init_session", async move { backend.init_session(&init).await });
    }

    pub(crate) fn append(
        &self,
        session_id: &str,
        role: Role,
        content: impl Into<String>,
        idempotency_key: String,
        trace_id: Option<String>,
    ) {
        let backend = Arc::clone(&self.backend);
        let session_id = session_id.to_string();
        let message = PersistedMessage {
            role: role.as_str().to_string(),
            content: content.into(),
            idempotency_key: Some(idempotency_key),
            trace_id,
        };
        spawn_detached("append_message", async move {
            backend.append_message(&session_id, &message).await
        });
    }

    pub(crate) fn cancel_job(&self, job_id: &str) {
        let backend = Arc::clone(&self.backend);
        let job_id = job_id.to_string();
        tracing::info!(job_id = %job_id, "Cancelling scan job");
        spawn_detached("cancel_job", async move { backend.cancel_job(&job_id).await });
    }
}

/// Run `fut` in the background when a runtime is available.
fn spawn_detached<F>(label: &'static str, fut: F)
where
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = fut.await {
                    tracing::warn!(operation = label, kind = e.kind().as_str(), code = e.code(), "Backend write failed: {}", e);
                }
            });
        }
        Err(_) => {
            tracing::debug!(operation = label, "No async runtime, dropping backend write");
        }
    }
}
