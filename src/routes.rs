use crate::{handlers, AppState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Creates the Axum router and associates routes with handlers.
pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/health", get(handlers::health))
        .route("/memes", post(handlers::upload_meme))
        .route("/memes/{id}", get(handlers::get_meme).delete(handlers::delete_meme))
        .route("/memes/{id}/like", post(handlers::like_meme))
        .route("/memes/{id}/download", get(handlers::download_meme))
        .route("/memes/{id}/image", get(handlers::get_image))
        .route("/memes/{id}/comments", post(handlers::add_comment))
        .route("/memes/{id}/comments/{comment_ref}", delete(handlers::delete_comment))
        .route("/memes/{id}/save", put(handlers::toggle_save))
        .route("/me/memes", get(handlers::list_my_memes))
        .route("/me/saved", get(handlers::list_saved))
        .route("/me/account/{action}", post(handlers::record_account_event))
        .route("/activity", get(handlers::list_activity))
        // Middleware Layers
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
