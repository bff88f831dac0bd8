use futures::StreamExt;
use log::{debug, info};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;

use crate::chat::transport::{ApiResponse, ChatTransport, RequestRound};
use crate::chat::ChatError;
use crate::config::Settings;
use crate::web::models::{ChunkData, RelayRequest};

pub const CONVERSATION_HEADER: &str = "X-Conversation-ID";
pub const ROUND_HEADER: &str = "X-Round-ID";

// Client for the research backend API
#[derive(Clone)]
pub struct BackendClient {
    host: String,
    api_key: String,
    chat_endpoint: String,
    client: Client,
}

impl BackendClient {
    pub fn new(settings: &Settings) -> Self {
        info!("Initializing backend client for {}", settings.fintool_host);
        Self {
            host: settings.fintool_host.clone(),
            api_key: settings.fintool_api_key.clone(),
            chat_endpoint: settings.chat_endpoint.clone(),
            client: Client::new(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.host, path.trim_start_matches('/'));
        self.client
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
    }

    /// POST a relay request upstream. Non-2xx responses become
    /// `ChatError::Status` carrying the backend's body.
    pub async fn forward_chat(
        &self,
        relay: &RelayRequest,
        headers: &[(&str, String)],
    ) -> Result<Response, ChatError> {
        let payload = relay.backend_payload();
        debug!("Forwarding chat request to {}: {}", relay.endpoint, payload);

        let mut request = self
            .request(Method::POST, &relay.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status { status, body });
        }
        Ok(response)
    }

    fn chunk_request(&self, search_result_id: &str) -> RequestBuilder {
        self.request(Method::GET, "v1/chunks")
            .query(&[("ids", search_result_id)])
    }

    /// Look up one search-result chunk. `Ok(None)` when the backend has no data.
    pub async fn fetch_chunk(&self, search_result_id: &str) -> Result<Option<ChunkData>, ChatError> {
        let response = self.chunk_request(search_result_id).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Status { status, body });
        }

        let chunks: Value = response.json().await?;
        Ok(chunks
            .as_array()
            .and_then(|items| items.first())
            .map(ChunkData::from_value))
    }
}

fn is_json(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false)
}

impl ChatTransport for BackendClient {
    async fn send(&self, round: &RequestRound) -> Result<ApiResponse, ChatError> {
        let request = match serde_json::to_value(&round.request) {
            Ok(Value::Object(map)) => map,
            Ok(other) => return Err(ChatError::InvalidBody(other.to_string())),
            Err(e) => return Err(ChatError::InvalidBody(e.to_string())),
        };
        let relay = RelayRequest {
            request,
            endpoint: self.chat_endpoint.clone(),
        };
        let headers = [
            (CONVERSATION_HEADER, round.conversation_id.clone()),
            (ROUND_HEADER, round.round_id.clone()),
        ];

        let response = self.forward_chat(&relay, &headers).await?;
        let json = is_json(&response);
        let body = Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(ChatError::from)));

        Ok(if json {
            ApiResponse::json(body)
        } else {
            ApiResponse::sse(body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client() -> BackendClient {
        BackendClient::new(&Settings {
            fintool_host: "http://backend.test".to_string(),
            fintool_api_key: "key".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            chat_endpoint: "v1/chat".to_string(),
            keep_last_n: 3,
            templates_glob: String::new(),
            session_idle: Duration::from_secs(60),
        })
    }

    #[test]
    fn chunk_id_is_url_encoded() {
        let request = client().chunk_request("a b&c=d").build().unwrap();

        assert_eq!(request.url().path(), "/v1/chunks");
        assert_eq!(request.url().query(), Some("ids=a+b%26c%3Dd"));
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer key");
    }
}
