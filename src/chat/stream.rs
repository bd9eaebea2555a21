//! Streamed answers to free-form questions.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::backend::{FallbackRequest, StreamRequest};
use crate::chat::frame::{FrameDecoder, StreamFrame};
use crate::chat::{ActiveStream, ChatSession};
use crate::session::{ActivityKind, ActivityToken};
use crate::timeline::{Message, MessageContent, Role};

const STREAM_ACTIVITY: &str = "answer";
const FALLBACK_FAILURE: &str = "Sorry, I couldn't get an answer right now. Please try again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Answer finalized from the stream.
    Completed { message_id: String },
    /// The stream reported an error frame.
    Failed { message_id: String },
    /// The stream broke and the non-streaming endpoint was used instead.
    FellBack { answered: bool },
    /// Cancelled or superseded by a newer question.
    Cancelled,
    /// No completed scan to ask about.
    NoJob,
}

/// Copy the live answer into permanent content and stop streaming.
pub(crate) fn finalize(message: &mut Message, error: Option<&str>) {
    let text = match error {
        Some(error) => error.to_string(),
        None => message.accumulated_text.clone(),
    };
    message.content = MessageContent::text(text);
    message.streaming = false;
    message.analyzing = false;
}

enum Applied {
    Continue,
    Finished { failed: bool },
    Stale,
}

struct StreamContext {
    token: ActivityToken,
    cancel: CancellationToken,
    message_id: String,
    session_id: String,
    job_id: String,
    question: String,
}

impl ChatSession {
    /// Ask a question about the bound scan and stream the answer into the
    /// timeline. Any answer still streaming is cancelled first.
    pub async fn ask(&self, question: &str) -> StreamOutcome {
        let question = question.trim().to_string();
        let Some(job) = self.bound_job() else {
            self.inner.with_state(|s| {
                s.timeline.upsert(
                    Message::agent("Run a scan first, then ask me about the results.").system(),
                )
            });
            return StreamOutcome::NoJob;
        };
        let session_id = self.inner.identity.ensure_id();

        let ctx = self.inner.with_state(|s| {
            s.stop_stream();
            let token = s.session.activity.begin(ActivityKind::Stream, STREAM_ACTIVITY);
            let cancel = CancellationToken::new();

            let user = Message::user(question.clone());
            let user_id = user.id.clone();
            s.timeline.upsert(user);
            let placeholder = Message::streaming_placeholder();
            let message_id = placeholder.id.clone();
            s.timeline.upsert(placeholder);

            s.stream = Some(ActiveStream {
                cancel: cancel.clone(),
                message_id: message_id.clone(),
            });
            s.session.stream_loading = true;
            (
                StreamContext {
                    token,
                    cancel,
                    message_id,
                    session_id: session_id.clone(),
                    job_id: job.job_id.clone(),
                    question: question.clone(),
                },
                user_id,
            )
        });
        let (ctx, user_message_id) = ctx;
        self.inner.persistence.append(
            &session_id,
            Role::User,
            question.clone(),
            format!("{session_id}:{user_message_id}"),
            None,
        );

        let request = StreamRequest {
            job_id: ctx.job_id.clone(),
            question: ctx.question.clone(),
            session_id: ctx.session_id.clone(),
            user_id: self.inner.persistence.user_id().to_string(),
        };
        let opened = tokio::select! {
            _ = ctx.cancel.cancelled() => return StreamOutcome::Cancelled,
            opened = self.inner.backend.open_stream(&request) => opened,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(kind = e.kind().as_str(), code = e.code(), "Answer stream failed to open: {}", e);
                return self.fall_back(&ctx).await;
            }
        };

        let mut decoder = FrameDecoder::new();
        loop {
            let next = tokio::select! {
                _ = ctx.cancel.cancelled() => return StreamOutcome::Cancelled,
                next = body.next() => next,
            };
            let frames = match next {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => {
                    tracing::warn!("Answer stream interrupted: {}", e);
                    return self.fall_back(&ctx).await;
                }
                None => {
                    let mut frames = decoder.finish();
                    // A stream that closes without `done` still finalizes.
                    frames.push(StreamFrame::Done);
                    frames
                }
            };
            match self.apply_frames(&ctx, frames) {
                Applied::Continue => {}
                Applied::Stale => return StreamOutcome::Cancelled,
                Applied::Finished { failed } => {
                    if decoder.skipped() > 0 {
                        tracing::debug!(skipped = decoder.skipped(), "Skipped malformed frames");
                    }
                    return self.finish_stream(&ctx, failed);
                }
            }
        }
    }

    /// Cancel the answer being streamed, keeping any partial text.
    pub fn cancel_stream(&self) -> bool {
        self.inner.with_state(|s| s.stop_stream())
    }

    /// Apply decoded frames under the state lock.
    fn apply_frames(&self, ctx: &StreamContext, frames: Vec<StreamFrame>) -> Applied {
        if frames.is_empty() {
            return Applied::Continue;
        }
        self.inner.with_state(|s| {
            if ctx.cancel.is_cancelled() || !s.session.activity.is_current(&ctx.token) {
                return Applied::Stale;
            }
            for frame in frames {
                let mut finished = None;
                let found = s.timeline.update(&ctx.message_id, |m| match frame {
                    StreamFrame::Token { content } => m.accumulated_text.push_str(&content),
                    StreamFrame::Thinking { content } => {
                        m.accumulated_reasoning.push_str(&content)
                    }
                    StreamFrame::ToolStart { tool } => {
                        tracing::debug!(?tool, "Tool started");
                        m.analyzing = true;
                    }
                    StreamFrame::ToolEnd { .. } => m.analyzing = false,
                    StreamFrame::TraceId { content } => m.trace_id = Some(content),
                    StreamFrame::Done => {
                        finalize(m, None);
                        finished = Some(false);
                    }
                    StreamFrame::Error { content } => {
                        let text = if content.trim().is_empty() {
                            FALLBACK_FAILURE.to_string()
                        } else {
                            content
                        };
                        finalize(m, Some(&text));
                        finished = Some(true);
                    }
                });
                if !found {
                    return Applied::Stale;
                }
                if let Some(failed) = finished {
                    s.stream = None;
                    s.session.stream_loading = false;
                    s.session.activity.finish(&ctx.token);
                    return Applied::Finished { failed };
                }
            }
            Applied::Continue
        })
    }

    fn finish_stream(&self, ctx: &StreamContext, failed: bool) -> StreamOutcome {
        let message_id = ctx.message_id.clone();
        if failed {
            return StreamOutcome::Failed { message_id };
        }
        let answer = self.inner.with_state(|s| {
            s.timeline
                .get(&message_id)
                .map(|m| (m.text().unwrap_or_default().to_string(), m.trace_id.clone()))
        });
        if let Some((text, trace_id)) = answer
            && !text.is_empty()
        {
            self.inner.persistence.append(
                &ctx.session_id,
                Role::Agent,
                text,
                format!("{}:{}", ctx.session_id, message_id),
                trace_id,
            );
        }
        StreamOutcome::Completed { message_id }
    }

    /// Replace the broken stream with one non-streaming request.
    async fn fall_back(&self, ctx: &StreamContext) -> StreamOutcome {
        let still_current = self.inner.with_state(|s| {
            if ctx.cancel.is_cancelled() || !s.session.activity.is_current(&ctx.token) {
                return false;
            }
            s.timeline.remove(&ctx.message_id);
            true
        });
        if !still_current {
            return StreamOutcome::Cancelled;
        }

        let request = FallbackRequest {
            job_id: ctx.job_id.clone(),
            question: ctx.question.clone(),
        };
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return StreamOutcome::Cancelled,
            result = self.inner.backend.send_chat_fallback(&request) => result,
        };

        let answered = result.is_ok();
        let message = match result {
            Ok(answer) => Message::agent(answer.answer).with_trace_id(answer.trace_id),
            Err(e) => {
                tracing::warn!(kind = e.kind().as_str(), code = e.code(), "Fallback answer failed: {}", e);
                Message::agent(FALLBACK_FAILURE)
            }
        };
        let persisted = answered.then(|| {
            (
                message.text().unwrap_or_default().to_string(),
                message.trace_id.clone(),
                message.id.clone(),
            )
        });

        let applied = self.inner.with_state(|s| {
            if ctx.cancel.is_cancelled() || !s.session.activity.finish(&ctx.token) {
                return false;
            }
            s.stream = None;
            s.session.stream_loading = false;
            s.timeline.upsert(message);
            true
        });
        if !applied {
            return StreamOutcome::Cancelled;
        }
        if let Some((text, trace_id, id)) = persisted {
            self.inner.persistence.append(
                &ctx.session_id,
                Role::Agent,
                text,
                format!("{}:{}", ctx.session_id, id),
                trace_id,
            );
        }
        StreamOutcome::FellBack { answered }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FallbackAnswer, JobState, JobStatusReport, ScanType};
    use crate::chat::testing::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn chat_with_job(backend: &MockBackend) -> ChatSession {
        backend.push_statuses("job-1", [JobStatusReport::new(JobState::Success, 3)]);
        let chat = chat_with(backend);
        chat.start_scan(FRIENDLY, ScanType::Transactions, None).await;
        settle().await;
        assert!(chat.bound_job().is_some());
        chat
    }

    fn frame(json: &str) -> Vec<u8> {
        format!("data: {json}\n").into_bytes()
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_without_done_finalize_on_close() {
        let backend = MockBackend::new();
        backend.set_stream_chunks(vec![
            frame(r#"{"type":"trace_id","content":"tr-9"}"#),
            frame(r#"{"type":"thinking","content":"counting"}"#),
            frame(r#"{"type":"token","content":"There were "}"#),
            frame(r#"{"type":"token","content":"3 transfers."}"#),
        ]);
        let chat = chat_with_job(&backend).await;

        let outcome = chat.ask("how many transfers?").await;
        let StreamOutcome::Completed { message_id } = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };

        let answer = chat
            .messages()
            .into_iter()
            .find(|m| m.id == message_id)
            .unwrap();
        assert!(!answer.streaming);
        assert_eq!(answer.content.as_text(), Some("There were 3 transfers."));
        assert_eq!(answer.accumulated_reasoning, "counting");
        assert_eq!(answer.trace_id.as_deref(), Some("tr-9"));
        assert!(!chat.is_loading());

        let request = &backend.stream_requests()[0];
        assert_eq!(request.job_id, "job-1");
        assert_eq!(request.question, "how many transfers?");
        assert_eq!(request.session_id, chat.session_id());

        settle().await;
        let last = backend.appended().last().cloned().unwrap().1;
        assert_eq!(last.content, "There were 3 transfers.");
        assert_eq!(last.trace_id.as_deref(), Some("tr-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn split_frames_decode_to_hello() {
        let backend = MockBackend::new();
        backend.set_stream_chunks(vec![
            b"data: {\"type\":\"token\",\"content\":\"Hel\"}\ndata: {\"type\":\"token\",".to_vec(),
            b"\"content\":\"lo\"}\ndata: {\"type\":\"done\"}\n".to_vec(),
        ]);
        let chat = chat_with_job(&backend).await;

        chat.ask("greet me").await;
        assert_eq!(chat.messages().last().unwrap().text(), Some("Hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn tool_frames_toggle_analyzing() {
        let backend = MockBackend::new();
        backend.set_stream_chunks(vec![frame(r#"{"type":"tool_start","tool":"sql"}"#)]);
        backend.set_stream_end(StreamEnd::Hang);
        let chat = chat_with_job(&backend).await;

        let runner = chat.clone();
        let task = tokio::spawn(async move { runner.ask("sum it").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let live = chat.messages().last().cloned().unwrap();
        assert!(live.streaming);
        assert!(live.analyzing);

        chat.cancel_stream();
        assert_eq!(task.await.unwrap(), StreamOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_timeline_updates() {
        let backend = MockBackend::new();
        backend.set_stream_chunks(vec![frame(r#"{"type":"token","content":"partial"}"#)]);
        backend.set_stream_end(StreamEnd::Hang);
        let chat = chat_with_job(&backend).await;

        let runner = chat.clone();
        let task = tokio::spawn(async move { runner.ask("long question").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(chat.cancel_stream());
        assert_eq!(task.await.unwrap(), StreamOutcome::Cancelled);

        let last = chat.messages().last().cloned().unwrap();
        assert!(!last.streaming);
        assert_eq!(last.content.as_text(), Some("partial"));
        assert!(!chat.is_loading());
        assert!(backend.fallback_requests().is_empty());
        assert!(!chat.cancel_stream());
    }

    #[tokio::test(start_paused = true)]
    async fn new_question_supersedes_open_stream() {
        let backend = MockBackend::new();
        backend.set_stream_end(StreamEnd::Hang);
        let chat = chat_with_job(&backend).await;

        let runner = chat.clone();
        let first = tokio::spawn(async move { runner.ask("first").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let runner = chat.clone();
        let second = tokio::spawn(async move { runner.ask("second").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(first.await.unwrap(), StreamOutcome::Cancelled);
        let streaming = chat.messages().iter().filter(|m| m.streaming).count();
        assert_eq!(streaming, 1);

        chat.cancel_stream();
        assert_eq!(second.await.unwrap(), StreamOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_falls_back_once() {
        let backend = MockBackend::new();
        backend.set_stream_chunks(vec![frame(r#"{"type":"token","content":"Par"}"#)]);
        backend.set_stream_end(StreamEnd::Fail);
        backend.set_fallback(Ok(FallbackAnswer {
            answer: "Full answer".to_string(),
            trace_id: Some("tr-fallback".to_string()),
        }));
        let chat = chat_with_job(&backend).await;

        let outcome = chat.ask("what happened?").await;
        assert_eq!(outcome, StreamOutcome::FellBack { answered: true });

        let messages = chat.messages();
        assert!(messages.iter().all(|m| !m.streaming));
        let last = messages.last().unwrap();
        assert_eq!(last.text(), Some("Full answer"));
        assert_eq!(last.trace_id.as_deref(), Some("tr-fallback"));
        assert_eq!(backend.fallback_requests().len(), 1);
        assert_eq!(backend.fallback_requests()[0].question, "what happened?");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fallback_yields_generic_message() {
        let backend = MockBackend::new();
        backend.fail_open();
        backend.set_fallback(Err("down".to_string()));
        let chat = chat_with_job(&backend).await;

        let outcome = chat.ask("anything?").await;
        assert_eq!(outcome, StreamOutcome::FellBack { answered: false });
        assert_eq!(chat.messages().last().unwrap().text(), Some(FALLBACK_FAILURE));
        assert!(!chat.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn error_frame_finalizes_with_error_text() {
        let backend = MockBackend::new();
        backend.set_stream_chunks(vec![
            frame(r#"{"type":"token","content":"Half"}"#),
            frame(r#"{"type":"error","content":"Query timed out"}"#),
            frame(r#"{"type":"token","content":"ignored"}"#),
        ]);
        let chat = chat_with_job(&backend).await;

        let outcome = chat.ask("slow question").await;
        assert!(matches!(outcome, StreamOutcome::Failed { .. }));
        let last = chat.messages().last().cloned().unwrap();
        assert_eq!(last.content.as_text(), Some("Query timed out"));
        assert!(!last.streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn asking_without_a_scan_gives_a_hint() {
        let backend = MockBackend::new();
        let chat = chat_with(&backend);
        assert_eq!(chat.ask("hello?").await, StreamOutcome::NoJob);
        assert!(backend.stream_requests().is_empty());
        assert_eq!(chat.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finished_answer_keeps_running_scan_loading() {
        let backend = MockBackend::new();
        backend.set_stream_chunks(vec![frame(r#"{"type":"done"}"#)]);
        let chat = chat_with_job(&backend).await;

        // job-2 has no scripted status and stays queued.
        let second = chat.start_scan(FRIENDLY, ScanType::Jettons, None).await;
        assert_eq!(second.as_deref(), Some("job-2"));
        assert!(chat.is_loading());

        chat.ask("what changed?").await;
        assert_eq!(chat.active_job().as_deref(), Some("job-2"));
        assert!(chat.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_scan_keeps_streaming_answer_loading() {
        let backend = MockBackend::new();
        backend.set_stream_chunks(vec![frame(r#"{"type":"token","content":"Par"}"#)]);
        backend.set_stream_end(StreamEnd::Hang);
        let chat = chat_with_job(&backend).await;

        let asking = chat.clone();
        let task = tokio::spawn(async move { asking.ask("still going?").await });
        settle().await;

        backend.push_statuses("job-2", [JobStatusReport::new(JobState::Success, 1)]);
        chat.start_scan(FRIENDLY, ScanType::Nfts, None).await;
        settle().await;
        assert!(chat.active_job().is_none());
        assert!(chat.is_loading());

        assert!(chat.cancel_stream());
        assert_eq!(task.await.unwrap(), StreamOutcome::Cancelled);
        assert!(!chat.is_loading());
    }
}
