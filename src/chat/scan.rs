//! Scan job submission and polling.

use std::sync::{Arc, Weak};

use crate::backend::{JobState, JobStatusReport, ScanRequest, ScanType};
use crate::chat::{ChatInner, ChatSession, ChatState};
use crate::session::{ActivityKind, BootstrapPhase, BoundJob, PendingLimit};
use crate::timeline::{Message, Role};

const PROGRESS_KEY: &str = "scan-progress";
const SCAN_ACTIVITY: &str = "scan";

#[derive(Debug, Clone)]
struct ScanJob {
    job_id: String,
    address: String,
    scan_type: ScanType,
}

impl ChatState {
    fn is_polling(&self, job_id: &str) -> bool {
        self.session.job_id.as_deref() == Some(job_id)
    }
}

impl ChatSession {
    /// Remember the scan type and ask how many items to fetch.
    ///
    /// Returns false when no address is bound yet.
    pub fn select_scan_type(&self, scan_type: ScanType) -> bool {
        self.inner.with_state(|s| {
            let Some(address) = s.session.address.clone() else {
                s.timeline.upsert(
                    Message::agent("Paste a TON address first, then pick what to scan.").system(),
                );
                return false;
            };
            s.session.scan_type = scan_type;
            s.session.pending_limit = Some(PendingLimit {
                address,
                scan_type,
            });
            s.timeline.upsert(
                Message::agent(format!(
                    "How many {} should I fetch? Reply with a number or \"all\".",
                    scan_type.label()
                ))
                .system(),
            );
            true
        })
    }

    /// Submit a scan and start polling it. Any job already running is
    /// superseded and cancelled.
    ///
    /// Returns the new job id, or `None` if submission failed or was
    /// superseded in turn.
    pub async fn start_scan(
        &self,
        address: &str,
        scan_type: ScanType,
        limit: Option<u32>,
    ) -> Option<String> {
        let inner = &self.inner;
        let (token, previous) = inner.with_state(|s| {
            if let Some(task) = s.poll_task.take() {
                task.abort();
            }
            let previous = s.session.job_id.take();
            let token = s.session.activity.begin(ActivityKind::Scan, SCAN_ACTIVITY);
            s.session.scan_loading = true;
            s.session.scan_type = scan_type;
            s.session.pending_limit = None;
            s.session.set_phase(address, BootstrapPhase::Done);
            s.timeline.upsert(
                Message::agent(format!("Starting the {} scan...", scan_type.label()))
                    .transient()
                    .with_dedupe_key(PROGRESS_KEY),
            );
            (token, previous)
        });
        if let Some(previous) = previous {
            tracing::info!(job_id = %previous, "Superseding running scan");
            inner.persistence.cancel_job(&previous);
        }

        let request = ScanRequest {
            address: address.to_string(),
            scan_type,
            limit,
        };
        let submitted = inner.backend.submit_scan(&request).await;

        let weak = Arc::downgrade(&self.inner);
        inner.with_state(|s| {
            if !s.session.activity.finish(&token) {
                if let Ok(submission) = &submitted {
                    inner.persistence.cancel_job(&submission.job_id);
                }
                return None;
            }
            match submitted {
                Ok(submission) => {
                    tracing::info!(
                        job_id = %submission.job_id,
                        address,
                        scan_type = scan_type.as_str(),
                        "Scan submitted"
                    );
                    s.session.job_id = Some(submission.job_id.clone());
                    let job = ScanJob {
                        job_id: submission.job_id.clone(),
                        address: address.to_string(),
                        scan_type,
                    };
                    s.poll_task = Some(tokio::spawn(poll_job(weak, job)));
                    Some(submission.job_id)
                }
                Err(e) => {
                    tracing::warn!(kind = e.kind().as_str(), code = e.code(), "Scan submission failed: {}", e);
                    s.session.scan_loading = false;
                    s.timeline.upsert(Message::agent(format!(
                        "I couldn't start the {} scan. Please try again.",
                        scan_type.label()
                    )));
                    None
                }
            }
        })
    }

    /// Stop the running scan, cancelling it on the backend. A scan still
    /// being submitted is cancelled once its job id arrives.
    pub fn cancel_scan(&self) -> bool {
        let (submitting, job) = self.inner.with_state(|s| {
            if let Some(task) = s.poll_task.take() {
                task.abort();
            }
            let submitting = s.session.activity.is_active(ActivityKind::Scan, SCAN_ACTIVITY);
            s.session.activity.cancel_kind(ActivityKind::Scan);
            let job = s.session.clear_job();
            s.timeline.remove_by_dedupe_key(PROGRESS_KEY);
            if submitting || job.is_some() {
                s.timeline.upsert(Message::agent("Scan cancelled.").system());
            }
            (submitting, job)
        });
        if let Some(job_id) = &job {
            self.inner.persistence.cancel_job(job_id);
        }
        submitting || job.is_some()
    }
}

/// Poll `job` until it reaches a terminal status or stops being the
/// conversation's active job.
async fn poll_job(weak: Weak<ChatInner>, job: ScanJob) {
    loop {
        let (backend, interval) = {
            let Some(inner) = weak.upgrade() else { return };
            if !inner.with_state(|s| s.is_polling(&job.job_id)) {
                return;
            }
            (Arc::clone(&inner.backend), inner.settings.poll_interval)
        };

        let result = backend.get_job_status(&job.job_id).await;

        let Some(inner) = weak.upgrade() else { return };
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(job_id = %job.job_id, kind = e.kind().as_str(), code = e.code(), "Lost scan status: {}", e);
                inner.with_state(|s| {
                    if !s.is_polling(&job.job_id) {
                        return;
                    }
                    s.session.clear_job();
                    s.poll_task = None;
                    s.timeline.upsert(Message::agent(
                        "Connection lost while checking the scan. Please try again.",
                    ));
                });
                return;
            }
        };

        if !report.status.is_terminal() {
            let still_polling = inner.with_state(|s| {
                if !s.is_polling(&job.job_id) {
                    return false;
                }
                s.timeline.upsert(
                    Message::agent(progress_text(&job, &report))
                        .transient()
                        .with_dedupe_key(PROGRESS_KEY),
                );
                true
            });
            if !still_polling {
                return;
            }
            drop(inner);
            tokio::time::sleep(interval).await;
            continue;
        }

        finish_job(&inner, &job, report);
        return;
    }
}

fn progress_text(job: &ScanJob, report: &JobStatusReport) -> String {
    match report.status {
        JobState::Queued => format!("Scan queued for {}...", job.address),
        _ => format!(
            "Scanning {}... {} found so far.",
            job.scan_type.label(),
            report.count
        ),
    }
}

fn completion_text(job: &ScanJob, report: &JobStatusReport) -> String {
    let mut text = format!(
        "Scan complete: found {} {} for {}. Ask me anything about them.",
        report.count,
        job.scan_type.label(),
        job.address
    );
    if let Some(url) = &report.download_url {
        text.push_str(&format!("\nDownload: {url}"));
    }
    text
}

fn finish_job(inner: &ChatInner, job: &ScanJob, report: JobStatusReport) {
    let completed = inner.with_state(|s| {
        if !s.is_polling(&job.job_id) {
            return None;
        }
        s.session.clear_job();
        s.poll_task = None;
        s.timeline.remove_by_dedupe_key(PROGRESS_KEY);

        match report.status {
            JobState::Success => {
                s.session.bound_job = Some(BoundJob {
                    job_id: job.job_id.clone(),
                    address: job.address.clone(),
                    scan_type: job.scan_type,
                    count: report.count,
                });
                let text = completion_text(job, &report);
                s.timeline.upsert(
                    Message::agent(text.clone())
                        .with_dedupe_key(format!("scan-result:{}", job.job_id)),
                );
                Some(text)
            }
            JobState::Empty => {
                s.timeline.upsert(Message::agent(format!(
                    "No {} found for {}.",
                    job.scan_type.label(),
                    job.address
                )));
                None
            }
            JobState::Error | JobState::Unknown => {
                let text = report
                    .error
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "The scan failed. Please try again.".to_string());
                s.timeline.upsert(Message::agent(text));
                None
            }
            JobState::Cancelled => None,
            JobState::Queued | JobState::Processing => None,
        }
    });
    tracing::info!(job_id = %job.job_id, status = ?report.status, count = report.count, "Scan finished");

    let Some(completion) = completed else { return };
    let session_id = inner.identity.ensure_id();
    inner.persistence.init_session(
        &session_id,
        None,
        Some(job.address.clone()),
        Some(job.job_id.clone()),
    );
    inner.persistence.append(
        &session_id,
        Role::User,
        format!("Scan {}", job.scan_type.label()),
        format!("{session_id}:scan:{}:request", job.job_id),
        None,
    );
    inner.persistence.append(
        &session_id,
        Role::Agent,
        completion,
        format!("{session_id}:scan:{}:result", job.job_id),
        None,
    );
}
