pub mod assembler;
pub mod error;
pub mod message;
pub mod session;
pub mod sse;
pub mod state;
pub mod transport;

pub use error::ChatError;
pub use message::{ChatMessage, UserMessage};
pub use session::{AppendStatus, ChatSession};
