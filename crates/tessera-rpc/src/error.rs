use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tessera_consensus::ConsensusError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Mempool error: {0}")]
    Mempool(#[from] tessera_mempool::MempoolError),

    #[error("Core error: {0}")]
    Core(#[from] tessera_core::CoreError),

    #[error("State error: {0}")]
    State(#[from] tessera_state::StateError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),
}

impl RpcError {
    fn status(&self) -> StatusCode {
        match self {
            RpcError::NotFound(_) => StatusCode::NOT_FOUND,
            RpcError::BadRequest(_) | RpcError::Core(_) => StatusCode::BAD_REQUEST,
            RpcError::Mempool(tessera_mempool::MempoolError::PoolFull) => StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Mempool(_) => StatusCode::BAD_REQUEST,
            // Full queue or stopped runner; the peer retries on its next message
            RpcError::Consensus(ConsensusError::Transport(_)) => StatusCode::SERVICE_UNAVAILABLE,
            RpcError::Consensus(_) => StatusCode::BAD_REQUEST,
            RpcError::Internal(_) | RpcError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.to_string(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}
