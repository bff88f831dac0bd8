use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::chat::ChatMessage;

/// Body accepted by the relay route and sent to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayRequest {
    pub request: Map<String, Value>,
    pub endpoint: String,
}

impl RelayRequest {
    /// Backend payload: `use_sharepoint` travels upstream as `use_kendra`.
    pub fn backend_payload(&self) -> Value {
        let mut payload = self.request.clone();
        if let Some(flag) = payload.remove("use_sharepoint") {
            if !flag.is_null() {
                payload.insert("use_kendra".to_string(), flag);
            }
        }
        Value::Object(payload)
    }
}

#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    pub content: String,
    pub keep_last_n: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ConversationView {
    pub conversation_id: Uuid,
    pub messages: Vec<ChatMessage>,
    pub is_loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IndexQuery {
    pub conversation: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkData {
    pub id: String,
    pub text: String,
    pub document_id: String,
    pub document_url: String,
    pub ticker: String,
    pub doc_type: String,
}

impl ChunkData {
    /// Normalise a raw backend chunk; missing or non-string fields become "".
    pub fn from_value(raw: &Value) -> Self {
        let field = |key: &str| {
            raw.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Self {
            id: field("id"),
            text: field("text"),
            document_id: field("document_id"),
            document_url: field("document_url"),
            ticker: field("ticker"),
            doc_type: field("doc_type"),
        }
    }
}
