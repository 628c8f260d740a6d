//! Tessera RPC - HTTP and WebSocket API
//!
//! Serves chain queries and transaction submission to clients, accepts
//! consensus messages from peer validators and streams commit events
//! over WebSocket.

pub mod error;
pub mod http;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tessera_consensus::{RunnerHandle, ValidatorEndpoint};
use tessera_mempool::Mempool;
use tessera_state::{ChainStore, Storage};
use tokio::sync::RwLock;
use tracing::info;

use http::{create_router, AppState};
use ws::{create_ws_router, EventBroadcaster};

pub use error::RpcError;
pub use http::handlers::{BlockResponse, StatusResponse, TxSubmitRequest, TxSubmitResponse, GOSSIP_HEADER};
pub use ws::WsEvent;

/// RPC server configuration
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// HTTP bind address
    pub http_addr: SocketAddr,
    /// Enable WebSocket
    pub enable_ws: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_ws: true,
        }
    }
}

/// Everything the handlers read from or write to
pub struct RpcContext<S: Storage> {
    pub chain_id: u64,
    pub chain: Arc<RwLock<ChainStore<S>>>,
    pub mempool: Arc<Mempool>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub consensus: RunnerHandle,
    pub peers: Vec<ValidatorEndpoint>,
}

/// RPC server
pub struct RpcServer<S: Storage> {
    config: RpcConfig,
    app_state: Arc<AppState<S>>,
}

impl<S: Storage + 'static> RpcServer<S> {
    pub fn new(config: RpcConfig, context: RpcContext<S>) -> Self {
        let app_state = Arc::new(AppState {
            chain_id: context.chain_id,
            chain: context.chain,
            mempool: context.mempool,
            broadcaster: context.broadcaster,
            consensus: context.consensus,
            peers: context.peers,
            client: reqwest::Client::new(),
        });

        RpcServer { config, app_state }
    }

    /// Get the event broadcaster
    pub fn broadcaster(&self) -> Arc<EventBroadcaster> {
        Arc::clone(&self.app_state.broadcaster)
    }

    /// Create the combined router
    pub fn router(&self) -> Router {
        let http_router = create_router(Arc::clone(&self.app_state));

        if self.config.enable_ws {
            let ws_router = create_ws_router(
                Arc::clone(&self.app_state.broadcaster),
                self.app_state.consensus.subscribe_status(),
            );
            http_router.merge(ws_router)
        } else {
            http_router
        }
    }

    /// Serve until the listener fails
    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = self.config.http_addr;

        info!("Starting RPC server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tessera_consensus::{
        Collaborators, ConsensusRunner, DigestExecutor, EngineConfig, EngineRegistry, HttpNetwork, RunnerConfig,
    };
    use tessera_core::{ConsensusMessage, GenesisConfig, KeyPair, MessagePayload, QuorumRule, Transaction, ValidatorInfo};
    use tessera_mempool::MempoolConfig;
    use tessera_state::MemoryStorage;
    use tower::ServiceExt;

    /// A server over an engine that is built but never run, so queued
    /// messages stay queued
    fn server() -> (RpcServer<MemoryStorage>, ConsensusRunner, Arc<Mempool>) {
        let kp = KeyPair::from_seed(3);
        let genesis = GenesisConfig {
            chain_id: 5,
            timestamp: 0,
            validators: vec![ValidatorInfo::new(kp.public, 1)],
            quorum_rule: QuorumRule::Byzantine,
        };
        let mut chain = ChainStore::open(MemoryStorage::new()).unwrap();
        chain.initialize(&genesis.create_genesis_block()).unwrap();
        let chain = Arc::new(RwLock::new(chain));
        let mempool = Arc::new(Mempool::new(MempoolConfig::default()));
        let broadcaster = Arc::new(EventBroadcaster::default());

        let engine = EngineRegistry::with_defaults()
            .build("HOTSTUFF", EngineConfig::new(kp.clone(), genesis))
            .unwrap();
        let collaborators = Collaborators {
            network: Arc::new(HttpNetwork::new(kp.public, Vec::new(), Duration::from_secs(1)).unwrap()),
            pool: mempool.clone(),
            executor: Arc::new(DigestExecutor),
            store: chain.clone(),
            sinks: vec![broadcaster.clone()],
        };
        let (runner, handle) = ConsensusRunner::new(engine, collaborators, RunnerConfig::default());

        let server = RpcServer::new(
            RpcConfig::default(),
            RpcContext {
                chain_id: 5,
                chain,
                mempool: mempool.clone(),
                broadcaster,
                consensus: handle,
                peers: Vec::new(),
            },
        );
        (server, runner, mempool)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_genesis() {
        let (server, _runner, _) = server();
        let response = server
            .router()
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["chain_id"], 5);
        assert_eq!(json["height"], 0);
        assert_eq!(json["mempool_size"], 0);
        assert!(json["head_block_hash"].is_string());
    }

    #[test]
    fn test_view_event_from_engine_status() {
        let (server, _runner, _) = server();
        let status = server.app_state.consensus.status();
        let json = serde_json::to_value(WsEvent::view_changed(&status)).unwrap();
        assert_eq!(json["type"], "ViewChanged");
        assert_eq!(json["data"]["view"], status.view);
        assert_eq!(json["data"]["leader"], status.leader.to_hex());
    }

    #[tokio::test]
    async fn test_missing_block_is_not_found() {
        let (server, _runner, _) = server();
        let response = server
            .router()
            .oneshot(Request::builder().uri("/block/9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_submit_tx_enters_mempool() {
        let (server, _runner, mempool) = server();
        let sender = KeyPair::from_seed(40);
        let tx = Transaction::new_signed(sender.public, 0, 3, b"data".to_vec(), &sender.secret).unwrap();
        let body = serde_json::to_vec(&TxSubmitRequest { transaction: tx.clone() }).unwrap();

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/tx")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "pending");
        assert!(mempool.contains(&tx.hash().unwrap()).await);
    }

    #[tokio::test]
    async fn test_consensus_message_is_queued() {
        let (server, _runner, _) = server();
        let peer = KeyPair::from_seed(4);
        let msg = ConsensusMessage::new_signed(1, MessagePayload::BlockRequest { block_hash: tessera_core::Hash::ZERO }, &peer)
            .unwrap();
        let body = serde_json::to_vec(&msg).unwrap();

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(tessera_consensus::MESSAGE_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["accepted"], true);
    }

    #[tokio::test]
    async fn test_consensus_message_rejected_after_stop() {
        let (server, runner, _) = server();
        drop(runner);
        let peer = KeyPair::from_seed(4);
        let msg = ConsensusMessage::new_signed(1, MessagePayload::BlockRequest { block_hash: tessera_core::Hash::ZERO }, &peer)
            .unwrap();

        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(tessera_consensus::MESSAGE_PATH)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&msg).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
