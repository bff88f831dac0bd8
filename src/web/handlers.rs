use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::{error, info};
use serde_json::json;
use std::sync::Arc;
use tera::Context;
use uuid::Uuid;

use crate::backend::{BackendClient, CONVERSATION_HEADER, ROUND_HEADER};
use crate::chat::{AppendStatus, ChatError, ChatSession, UserMessage};
use crate::web::models::{AppendRequest, ConversationView, IndexQuery, RelayRequest};
use crate::AppState;

fn conversation_view(id: Uuid, session: Option<&ChatSession<BackendClient>>) -> ConversationView {
    match session {
        Some(session) => ConversationView {
            conversation_id: id,
            messages: session.messages(),
            is_loading: session.is_loading(),
            error: session.error().map(|e| e.to_string()),
        },
        None => ConversationView {
            conversation_id: id,
            messages: Vec::new(),
            is_loading: false,
            error: None,
        },
    }
}

// Index page handler
pub async fn index(data: web::Data<AppState>, query: web::Query<IndexQuery>) -> impl Responder {
    let conversation_id = query.conversation.unwrap_or_else(Uuid::new_v4);
    let session = data.session(&conversation_id);
    let view = conversation_view(conversation_id, session.as_deref());

    let mut context = Context::new();
    context.insert("conversation", &view);
    match data.tera.render("index.html", &context) {
        Ok(html) => HttpResponse::Ok().content_type("text/html").body(html),
        Err(e) => {
            error!("Template error: {}", e);
            HttpResponse::InternalServerError().body("Template error")
        }
    }
}

// Health check endpoint
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

// Pass-through relay to the backend chat endpoint
pub async fn relay_chat(
    data: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<RelayRequest>,
) -> impl Responder {
    let headers: Vec<(&str, String)> = [CONVERSATION_HEADER, ROUND_HEADER]
        .into_iter()
        .filter_map(|name| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| (name, v.to_string()))
        })
        .collect();

    match data.backend.forward_chat(&body, &headers).await {
        Ok(response) => {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("text/event-stream")
                .to_string();
            HttpResponse::Ok()
                .content_type(content_type)
                .streaming(response.bytes_stream())
        }
        Err(e) => {
            error!("Relay error: {}", e);
            HttpResponse::InternalServerError().body("Failed to fetch the chat response.")
        }
    }
}

// Search-result chunk lookup
pub async fn get_chunk(data: web::Data<AppState>, path: web::Path<String>) -> impl Responder {
    let search_result_id = path.into_inner();
    if search_result_id.trim().is_empty() || search_result_id == "[object Object]" {
        return HttpResponse::BadRequest().json(json!({
            "error": "Invalid searchResultId parameter"
        }));
    }

    match data.backend.fetch_chunk(&search_result_id).await {
        Ok(Some(chunk)) => HttpResponse::Ok().json(chunk),
        Ok(None) => HttpResponse::NotFound().json(json!({ "error": "No chunk data found" })),
        Err(ChatError::Status { status, body }) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let message = if body.is_empty() {
                "Failed to fetch chunk data".to_string()
            } else {
                body
            };
            HttpResponse::build(status).json(json!({ "error": message }))
        }
        Err(e) => {
            error!("Error fetching chunk data: {}", e);
            HttpResponse::InternalServerError().json(json!({
                "error": "An error occurred while fetching the chunk data"
            }))
        }
    }
}

// Conversation state as seen by the presentation layer
pub async fn get_conversation(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    let conversation_id = path.into_inner();
    let session = data.session(&conversation_id);
    HttpResponse::Ok().json(conversation_view(conversation_id, session.as_deref()))
}

// Run one user turn against the backend
pub async fn post_message(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: web::Json<AppendRequest>,
) -> impl Responder {
    let conversation_id = path.into_inner();
    if req.content.trim().is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Message content is empty" }));
    }

    let keep_last_n = req.keep_last_n.unwrap_or(data.settings.keep_last_n);
    info!(
        "Chat request for conversation {}: {} (keep_last_n: {})",
        conversation_id, req.content, keep_last_n
    );

    let session: Arc<ChatSession<BackendClient>> = data.session_or_create(conversation_id);
    let status = session.append(UserMessage::new(req.content.clone()), keep_last_n).await;

    let view = conversation_view(conversation_id, Some(session.as_ref()));
    match status {
        AppendStatus::Busy => HttpResponse::Conflict().json(view),
        _ => HttpResponse::Ok().json(view),
    }
}

// Cancel the in-flight round, if any
pub async fn stop_conversation(data: web::Data<AppState>, path: web::Path<Uuid>) -> impl Responder {
    let conversation_id = path.into_inner();
    if let Some(session) = data.session(&conversation_id) {
        session.stop();
    }
    HttpResponse::NoContent().finish()
}
