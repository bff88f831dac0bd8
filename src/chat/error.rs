use thiserror::Error;

use crate::chat::state::ReducerError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request to chat backend failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("chat backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The round was aborted through its cancellation handle.
    #[error("chat round cancelled")]
    Cancelled,

    #[error(transparent)]
    Reducer(#[from] ReducerError),

    /// Inline error frame sent by the backend inside the stream.
    #[error("chat backend reported an error: {message}")]
    Backend {
        status: Option<String>,
        message: String,
    },

    #[error("invalid assistant message: {0}")]
    InvalidBody(String),
}

impl ChatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}
