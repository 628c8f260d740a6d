use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tessera_consensus::MESSAGE_PATH;
use tessera_state::Storage;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{consensus_message, get_block, get_block_by_hash, get_status, submit_tx, AppState};

/// Create the HTTP router
pub fn create_router<S: Storage + 'static>(state: Arc<AppState<S>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(get_status::<S>))
        .route("/tx", post(submit_tx::<S>))
        .route("/block/{height}", get(get_block::<S>))
        .route("/block/hash/{hash}", get(get_block_by_hash::<S>))
        .route(MESSAGE_PATH, post(consensus_message::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
