use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::chat::error::ChatError;
use crate::chat::message::ChatRequest;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ChatError>> + Send>>;

/// Response body handed back by a transport, before any parsing.
pub struct ApiResponse {
    /// `true` for an SSE body, `false` for a single JSON envelope.
    pub streaming: bool,
    pub body: ByteStream,
}

impl ApiResponse {
    pub fn sse(body: ByteStream) -> Self {
        Self { streaming: true, body }
    }

    pub fn json(body: ByteStream) -> Self {
        Self { streaming: false, body }
    }
}

/// One user turn in flight.
#[derive(Debug, Clone)]
pub struct RequestRound {
    pub conversation_id: String,
    pub round_id: String,
    pub request: ChatRequest,
    pub cancel: CancellationToken,
}

impl RequestRound {
    pub fn new(conversation_id: impl Into<String>, request: ChatRequest) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            round_id: new_round_id(),
            request,
            cancel: CancellationToken::new(),
        }
    }
}

fn new_round_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(21)
        .map(char::from)
        .collect()
}

/// Opens the response for one round. The HTTP implementation lives in
/// `backend`; tests script byte streams in memory.
pub trait ChatTransport: Send + Sync {
    fn send(
        &self,
        round: &RequestRound,
    ) -> impl Future<Output = Result<ApiResponse, ChatError>> + Send;
}
