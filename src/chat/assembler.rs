//! Folds a stream of SSE payloads into the current assistant snapshot.

use futures::StreamExt;
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::chat::error::ChatError;
use crate::chat::message::{validate_settled_state, EnvelopeMessage, ErrorFrame, Snapshot, StreamFrame};
use crate::chat::sse::{SseEvent, SseParser};
use crate::chat::state::{apply_operation, ColumnMapping, State};
use crate::chat::transport::ApiResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    Done(End),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    Completed,
    Stopped,
}

/// How a round settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The backend signalled completion.
    Completed(Snapshot),
    /// The backend reported the round as cancelled on its side.
    Stopped(Snapshot),
    /// The body ended without a completion signal.
    Truncated(Snapshot),
}

impl RoundOutcome {
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            RoundOutcome::Completed(s) | RoundOutcome::Stopped(s) | RoundOutcome::Truncated(s) => s,
        }
    }

    pub fn into_snapshot(self) -> Snapshot {
        match self {
            RoundOutcome::Completed(s) | RoundOutcome::Stopped(s) | RoundOutcome::Truncated(s) => s,
        }
    }
}

pub struct Assembler {
    phase: Phase,
    snapshot: Snapshot,
    state: State,
    /// Set once a `state_delta` frame has been folded.
    legacy: bool,
    mappings: Vec<ColumnMapping>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            phase: Phase::Streaming,
            snapshot: Snapshot::default(),
            state: State::new(),
            legacy: false,
            mappings: Vec::new(),
        }
    }

    /// Mappings used when folding legacy `state_delta` frames.
    pub fn with_column_mappings(mut self, mappings: Vec<ColumnMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done(_))
    }

    /// Handle one parsed event. Returns the new snapshot when the event
    /// changed the visible state.
    pub fn handle_event(&mut self, event: &SseEvent) -> Result<Option<Snapshot>, ChatError> {
        if self.is_done() {
            return Ok(None);
        }
        if !event.is_message() {
            debug!("Ignoring SSE event: {}", event.event);
            return Ok(None);
        }
        if event.data.is_empty() {
            return Ok(None);
        }
        self.handle_payload(&event.data)
    }

    fn handle_payload(&mut self, data: &str) -> Result<Option<Snapshot>, ChatError> {
        let frame = match StreamFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed stream frame: {}", e);
                return Ok(None);
            }
        };

        match frame {
            StreamFrame::Message(envelope) => {
                let next = self.snapshot.fold(&envelope.message);
                Ok(Some(self.advance(next, false)))
            }
            StreamFrame::StateDelta(delta) => {
                self.state = apply_operation(&self.state, &delta, &self.mappings)?;
                self.legacy = true;
                let next = self.snapshot.fold(&EnvelopeMessage::from_state(&self.state));
                let completed = self.state.get("status").and_then(|s| s.as_str()) == Some("Completed");
                Ok(Some(self.advance(next, completed)))
            }
            StreamFrame::Error(ErrorFrame::Status { status, message }) => match status.as_str() {
                "Completed" => {
                    self.phase = Phase::Done(End::Completed);
                    Ok(None)
                }
                "Cancelled" => {
                    debug!("Backend cancelled the round: {}", message);
                    self.phase = Phase::Done(End::Stopped);
                    Ok(None)
                }
                _ => Err(ChatError::Backend {
                    status: Some(status),
                    message,
                }),
            },
            StreamFrame::Error(ErrorFrame::Bare(message)) => Err(ChatError::Backend {
                status: None,
                message,
            }),
            StreamFrame::Other(kind) => {
                debug!("Ignoring stream frame of type {}", kind);
                Ok(None)
            }
        }
    }

    fn advance(&mut self, next: Snapshot, completed: bool) -> Snapshot {
        if completed || next.session_state().is_some() {
            self.phase = Phase::Done(End::Completed);
        }
        self.snapshot = next.clone();
        next
    }

    fn outcome(&self) -> Result<Option<RoundOutcome>, ChatError> {
        let outcome = match self.phase {
            Phase::Streaming => return Ok(None),
            Phase::Done(End::Completed) => RoundOutcome::Completed(self.snapshot.clone()),
            Phase::Done(End::Stopped) => RoundOutcome::Stopped(self.snapshot.clone()),
        };
        self.check_settled_state()?;
        Ok(Some(outcome))
    }

    fn check_settled_state(&self) -> Result<(), ChatError> {
        if !self.legacy {
            return Ok(());
        }
        validate_settled_state(&self.state).map_err(|e| {
            warn!("Settled state is not an assistant message: {}", e);
            ChatError::InvalidBody(e.to_string())
        })
    }

    /// Drive a response to completion, reporting every snapshot change.
    ///
    /// Cancellation is checked before each read; a cancelled round returns
    /// `ChatError::Cancelled` and never reports an outcome.
    pub async fn run<F>(
        mut self,
        response: ApiResponse,
        cancel: &CancellationToken,
        mut on_update: F,
    ) -> Result<RoundOutcome, ChatError>
    where
        F: FnMut(&Snapshot),
    {
        let ApiResponse { streaming, mut body } = response;
        let mut parser = SseParser::new();
        let mut whole = Vec::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ChatError::Cancelled),
                chunk = body.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) if cancel.is_cancelled() => {
                    debug!("Read failed after cancellation: {}", e);
                    return Err(ChatError::Cancelled);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            };

            if !streaming {
                whole.extend_from_slice(&bytes);
                continue;
            }

            for event in parser.feed(&bytes) {
                if let Some(snapshot) = self.handle_event(&event)? {
                    on_update(&snapshot);
                }
                if let Some(outcome) = self.outcome()? {
                    info!("Stream settled after completion signal");
                    return Ok(outcome);
                }
            }
        }

        if !streaming {
            return self.finish_json(&whole, &mut on_update);
        }

        for event in parser.finish() {
            if let Some(snapshot) = self.handle_event(&event)? {
                on_update(&snapshot);
            }
            if let Some(outcome) = self.outcome()? {
                return Ok(outcome);
            }
        }

        info!("Stream ended without completion signal");
        self.check_settled_state()?;
        Ok(RoundOutcome::Truncated(self.snapshot))
    }

    fn finish_json<F>(mut self, body: &[u8], on_update: &mut F) -> Result<RoundOutcome, ChatError>
    where
        F: FnMut(&Snapshot),
    {
        let text = String::from_utf8_lossy(body);
        let envelope = match StreamFrame::decode(&text) {
            Ok(StreamFrame::Message(envelope)) => envelope,
            Ok(other) => return Err(ChatError::InvalidBody(format!("{:?}", other))),
            Err(e) => return Err(ChatError::InvalidBody(e.to_string())),
        };
        self.snapshot = self.snapshot.fold(&envelope.message);
        on_update(&self.snapshot);
        Ok(RoundOutcome::Completed(self.snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use serde_json::json;

    use crate::chat::transport::ByteStream;

    fn envelope(message: serde_json::Value) -> String {
        json!({"id": "e", "createdAt": "2024-01-01T00:00:00Z", "type": "message", "message": message})
            .to_string()
    }

    fn sse(payloads: &[String]) -> String {
        payloads
            .iter()
            .map(|p| format!("event: message\ndata: {}\n\n", p))
            .collect()
    }

    fn body(chunks: Vec<String>) -> ByteStream {
        Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok::<_, ChatError>(Bytes::from(c))),
        ))
    }

    async fn run_sse(chunks: Vec<String>) -> (Result<RoundOutcome, ChatError>, Vec<Snapshot>) {
        let mut updates = Vec::new();
        let result = Assembler::new()
            .run(ApiResponse::sse(body(chunks)), &CancellationToken::new(), |s| {
                updates.push(s.clone())
            })
            .await;
        (result, updates)
    }

    #[tokio::test]
    async fn completes_on_session_state() {
        let text = sse(&[
            envelope(json!({"role": "assistant", "content": "Hel"})),
            envelope(json!({"role": "assistant", "content": "Hello", "metadata": {"sessionState": "abc"}})),
            envelope(json!({"role": "assistant", "content": "ignored after completion"})),
        ]);

        let (result, updates) = run_sse(vec![text]).await;

        let expected = Snapshot {
            thinking: String::new(),
            content: "Hello".into(),
            metadata: Some(crate::chat::message::MessageMetadata {
                session_state: Some("abc".into()),
                ..Default::default()
            }),
        };
        assert_eq!(result.unwrap(), RoundOutcome::Completed(expected.clone()));
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].content, "Hel");
        assert_eq!(updates[1], expected);
    }

    #[tokio::test]
    async fn skips_malformed_payload() {
        let text = format!(
            "{}data: {{not json\n\n{}",
            sse(&[envelope(json!({"role": "assistant", "content": "a"}))]),
            sse(&[envelope(json!({"role": "assistant", "content": "ab", "metadata": {"sessionState": "s"}}))]),
        );

        let (result, updates) = run_sse(vec![text]).await;

        assert!(matches!(result.unwrap(), RoundOutcome::Completed(s) if s.content == "ab"));
        assert_eq!(updates.len(), 2);
    }

    #[tokio::test]
    async fn snapshots_never_regress() {
        let text = sse(&[
            envelope(json!({"role": "assistant", "thinking": "plan", "content": "A"})),
            envelope(json!({"role": "assistant", "content": "AB"})),
            envelope(json!({"role": "assistant", "thinking": "", "content": "AB"})),
            envelope(json!({"role": "assistant", "thinking": "plan more"})),
        ]);
        let chunks: Vec<String> = text.as_bytes().chunks(7).map(|c| String::from_utf8_lossy(c).into_owned()).collect();

        let (result, updates) = run_sse(chunks).await;

        assert!(matches!(result.unwrap(), RoundOutcome::Truncated(_)));
        for pair in updates.windows(2) {
            assert!(pair[1].content.starts_with(&pair[0].content));
            assert!(pair[1].thinking.len() >= pair[0].thinking.len());
        }
        assert_eq!(updates.last().unwrap().content, "AB");
        assert_eq!(updates.last().unwrap().thinking, "plan more");
    }

    #[tokio::test]
    async fn ignores_non_message_events() {
        let text = format!(
            "event: progress\ndata: {}\n\n{}",
            envelope(json!({"role": "assistant", "content": "nope"})),
            sse(&[envelope(json!({"role": "assistant", "content": "yes"}))]),
        );

        let (result, updates) = run_sse(vec![text]).await;

        assert_eq!(result.unwrap().into_snapshot().content, "yes");
        assert_eq!(updates.len(), 1);
    }

    #[tokio::test]
    async fn inline_error_frames_are_classified() {
        let completed = sse(&[
            envelope(json!({"role": "assistant", "content": "x"})),
            json!({"type": "error", "data": {"status": "Completed", "message": "done"}}).to_string(),
        ]);
        let (result, _) = run_sse(vec![completed]).await;
        assert!(matches!(result.unwrap(), RoundOutcome::Completed(s) if s.content == "x"));

        let cancelled =
            sse(&[json!({"type": "error", "data": {"status": "Cancelled", "message": "bye"}}).to_string()]);
        let (result, _) = run_sse(vec![cancelled]).await;
        assert!(matches!(result.unwrap(), RoundOutcome::Stopped(_)));

        let failed = sse(&[json!({"type": "error", "data": {"status": "Failed", "message": "boom"}}).to_string()]);
        let (result, _) = run_sse(vec![failed]).await;
        assert!(matches!(result, Err(ChatError::Backend { message, .. }) if message == "boom"));

        let bare = sse(&[json!({"type": "error", "data": "kaput"}).to_string()]);
        let (result, _) = run_sse(vec![bare]).await;
        assert!(matches!(result, Err(ChatError::Backend { status: None, .. })));
    }

    #[tokio::test]
    async fn folds_legacy_state_deltas() {
        let frames = sse(&[
            json!({"type": "state_delta", "data": {"name": "set", "operation": {"values": {"mode": "chat", "content": "Hi"}}}}).to_string(),
            json!({"type": "state_delta", "data": {"name": "append", "operation": {"values": {"steps": "search"}}}}).to_string(),
            json!({"type": "state_delta", "data": {"name": "set", "operation": {"values": {"gpt_history": {"t1": "said hi"}, "status": "Completed"}}}}).to_string(),
        ]);

        let (result, updates) = run_sse(vec![frames]).await;

        let snapshot = result.unwrap();
        assert!(matches!(&snapshot, RoundOutcome::Completed(s) if s.content == "Hi"));
        let history = snapshot.into_snapshot().metadata.and_then(|m| m.gpt_history).unwrap();
        assert_eq!(history["t1"], "said hi");
        assert_eq!(updates.len(), 3);
    }

    #[tokio::test]
    async fn settled_legacy_state_must_be_an_assistant_message() {
        let frames = sse(&[
            json!({"type": "state_delta", "data": {"name": "set", "operation": {"values": {"content": "Hi"}}}}).to_string(),
            json!({"type": "error", "data": {"status": "Completed", "message": "done"}}).to_string(),
        ]);

        let (result, updates) = run_sse(vec![frames]).await;

        assert!(matches!(result, Err(ChatError::InvalidBody(_))));
        assert_eq!(updates.len(), 1);

        let truncated = sse(&[
            json!({"type": "state_delta", "data": {"name": "set", "operation": {"values": {"mode": "chat"}}}}).to_string(),
        ]);
        let (result, _) = run_sse(vec![truncated]).await;
        assert!(matches!(result, Err(ChatError::InvalidBody(_))));
    }

    #[tokio::test]
    async fn column_mappings_apply_to_legacy_frames() {
        let frames = sse(&[
            json!({"type": "state_delta", "data": {"name": "set", "operation": {"values": {"content": ["a", "b"]}}}}).to_string(),
        ]);
        let mappings = vec![ColumnMapping::for_key("content", |v| {
            json!(v.as_str().unwrap_or_default().to_uppercase())
        })];
        let mut assembler = Assembler::new().with_column_mappings(mappings);

        let mut parser = SseParser::new();
        for event in parser.feed(frames.as_bytes()) {
            assembler.handle_event(&event).unwrap();
        }

        assert_eq!(assembler.state["content"], json!(["A", "B"]));
        assert!(!assembler.is_done());
        assert_eq!(assembler.snapshot(), &Snapshot::default());
    }

    #[tokio::test]
    async fn unknown_delta_operation_aborts() {
        let frames =
            sse(&[json!({"type": "state_delta", "data": {"name": "merge", "operation": {}}}).to_string()]);

        let (result, _) = run_sse(vec![frames]).await;

        assert!(matches!(result, Err(ChatError::Reducer(_))));
    }

    #[tokio::test]
    async fn cancelled_round_reports_nothing() {
        let cancel = CancellationToken::new();
        let first = sse(&[envelope(json!({"role": "assistant", "content": "partial"}))]);
        let body: ByteStream = Box::pin(
            stream::iter(vec![Ok::<_, ChatError>(Bytes::from(first))]).chain(stream::pending()),
        );
        let mut updates = 0;

        let result = Assembler::new()
            .run(ApiResponse::sse(body), &cancel, |_| {
                updates += 1;
                cancel.cancel();
            })
            .await;

        assert!(matches!(result, Err(ChatError::Cancelled)));
        assert_eq!(updates, 1);
    }

    #[tokio::test]
    async fn json_body_completes_with_single_update() {
        let text = envelope(json!({"role": "assistant", "content": "whole answer"}));
        let half = text.len() / 2;
        let chunks = vec![text[..half].to_string(), text[half..].to_string()];
        let mut updates = 0;

        let result = Assembler::new()
            .run(ApiResponse::json(body(chunks)), &CancellationToken::new(), |_| updates += 1)
            .await;

        assert_eq!(result.unwrap().snapshot().content, "whole answer");
        assert_eq!(updates, 1);
    }
}
