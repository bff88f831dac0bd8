//! Conversation-level controller: owns the history, runs one round per user
//! turn and publishes the running view to observers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::chat::assembler::{Assembler, RoundOutcome};
use crate::chat::error::ChatError;
use crate::chat::message::{outbound_messages, ChatMessage, ChatRequest, UserMessage};
use crate::chat::transport::{ChatTransport, RequestRound};

pub const DEFAULT_KEEP_LAST_N: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    /// A round was already in flight; nothing happened.
    Busy,
    Completed,
    /// The backend stopped the round; the partial answer was kept.
    Stopped,
    /// `stop()` aborted the round; the partial answer was dropped.
    Cancelled,
    Failed,
}

struct InFlight {
    round_id: String,
    cancel: CancellationToken,
}

struct Inner {
    conversation_id: String,
    history: Arc<Vec<ChatMessage>>,
    in_flight: Option<InFlight>,
    error: Option<Arc<ChatError>>,
}

pub struct ChatSession<T> {
    transport: T,
    inner: Mutex<Inner>,
    published: watch::Sender<Vec<ChatMessage>>,
}

impl<T> ChatSession<T> {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, messages: Vec<ChatMessage>) {
        self.published.send_replace(messages);
    }
}

/// Releases the in-flight slot if the `append` future is dropped before its
/// round settles. The user turn stays and the provisional reply is dropped.
struct RoundGuard<'a, T> {
    session: &'a ChatSession<T>,
    round_id: String,
    cancel: CancellationToken,
    base: Arc<Vec<ChatMessage>>,
    settled: bool,
}

impl<T> Drop for RoundGuard<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!("Round {} abandoned before it settled", self.round_id);
        self.cancel.cancel();

        let mut inner = self.session.lock();
        if inner.in_flight.as_ref().map(|f| f.round_id.as_str()) != Some(self.round_id.as_str()) {
            return;
        }
        inner.in_flight = None;
        inner.history = self.base.clone();
        drop(inner);
        self.session.publish(self.base.as_ref().clone());
    }
}

impl<T: ChatTransport> ChatSession<T> {
    pub fn new(conversation_id: impl Into<String>, transport: T) -> Self {
        let (published, _) = watch::channel(Vec::new());
        Self {
            transport,
            inner: Mutex::new(Inner {
                conversation_id: conversation_id.into(),
                history: Arc::new(Vec::new()),
                in_flight: None,
                error: None,
            }),
            published,
        }
    }

    pub fn conversation_id(&self) -> String {
        self.lock().conversation_id.clone()
    }

    /// History plus the provisional assistant message while a round streams.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.published.borrow().clone()
    }

    /// Settled history only.
    pub fn history(&self) -> Arc<Vec<ChatMessage>> {
        self.lock().history.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    pub fn error(&self) -> Option<Arc<ChatError>> {
        self.lock().error.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ChatMessage>> {
        self.published.subscribe()
    }

    pub fn set_messages(&self, messages: Vec<ChatMessage>) {
        self.lock().history = Arc::new(messages.clone());
        self.publish(messages);
    }

    pub fn set_conversation_id(&self, conversation_id: impl Into<String>) {
        let conversation_id = conversation_id.into();
        let mut inner = self.lock();
        if inner.conversation_id != conversation_id {
            inner.conversation_id = conversation_id;
            inner.error = None;
        }
    }

    pub fn stop(&self) {
        if let Some(in_flight) = self.lock().in_flight.as_ref() {
            info!("Stopping round {}", in_flight.round_id);
            in_flight.cancel.cancel();
        }
    }

    pub async fn append(&self, message: UserMessage, keep_last_n: usize) -> AppendStatus {
        let (round, base) = {
            let mut inner = self.lock();
            if inner.in_flight.is_some() {
                debug!("Ignoring submit while a round is in flight");
                return AppendStatus::Busy;
            }

            let mut history = inner.history.as_ref().clone();
            history.push(message.into());
            let history = Arc::new(history);

            let request = ChatRequest {
                messages: outbound_messages(&history, keep_last_n),
                stream: true,
            };
            let round = RequestRound::new(inner.conversation_id.clone(), request);

            inner.history = history.clone();
            inner.error = None;
            inner.in_flight = Some(InFlight {
                round_id: round.round_id.clone(),
                cancel: round.cancel.clone(),
            });
            (round, history)
        };
        self.publish(base.as_ref().clone());
        let mut guard = RoundGuard {
            session: self,
            round_id: round.round_id.clone(),
            cancel: round.cancel.clone(),
            base: base.clone(),
            settled: false,
        };

        info!(
            "Starting round {} for conversation {} ({} messages upstream)",
            round.round_id,
            round.conversation_id,
            round.request.messages.len()
        );
        let result = self.drive(&round, &base).await;
        guard.settled = true;

        let mut inner = self.lock();
        if inner.in_flight.as_ref().map(|f| f.round_id.as_str()) == Some(round.round_id.as_str()) {
            inner.in_flight = None;
        }

        let (history, status) = match result {
            Ok(outcome) => {
                let status = match outcome {
                    RoundOutcome::Stopped(_) => AppendStatus::Stopped,
                    _ => AppendStatus::Completed,
                };
                let mut history = base.as_ref().clone();
                history.push(outcome.into_snapshot().into_message(&round.round_id).into());
                (Arc::new(history), status)
            }
            Err(e) if e.is_cancelled() => {
                info!("Round {} cancelled", round.round_id);
                (base, AppendStatus::Cancelled)
            }
            Err(e) => {
                error!("Error in chat round {}: {}", round.round_id, e);
                inner.error = Some(Arc::new(e));
                (base, AppendStatus::Failed)
            }
        };

        inner.history = history.clone();
        drop(inner);
        self.publish(history.as_ref().clone());
        status
    }

    async fn drive(
        &self,
        round: &RequestRound,
        base: &[ChatMessage],
    ) -> Result<RoundOutcome, ChatError> {
        let response = tokio::select! {
            biased;
            _ = round.cancel.cancelled() => return Err(ChatError::Cancelled),
            response = self.transport.send(round) => response?,
        };

        Assembler::new()
            .run(response, &round.cancel, |snapshot| {
                let mut messages = base.to_vec();
                messages.push(snapshot.clone().into_message(&round.round_id).into());
                self.publish(messages);
            })
            .await
    }
}
