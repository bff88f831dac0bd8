use actix_web::web;
use crate::web::handlers;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/chat", web::post().to(handlers::relay_chat))
            .route("/chunk/{search_result_id}", web::get().to(handlers::get_chunk))
            .route("/conversations/{id}", web::get().to(handlers::get_conversation))
            .route("/conversations/{id}/messages", web::post().to(handlers::post_message))
            .route("/conversations/{id}/stop", web::post().to(handlers::stop_conversation))
    )
    .route("/", web::get().to(handlers::index))
    .route("/health", web::get().to(handlers::health_check));
}
