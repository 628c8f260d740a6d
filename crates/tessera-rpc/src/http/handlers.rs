use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tessera_consensus::{EngineStatus, MessageAck, RunnerHandle, ValidatorEndpoint};
use tessera_core::{CommittedBlock, ConsensusMessage, Hash, Transaction};
use tessera_mempool::{Mempool, MempoolError};
use tessera_state::{ChainStore, Storage};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::ws::events::EventBroadcaster;

/// Header marking a transaction relayed by another validator
pub const GOSSIP_HEADER: &str = "x-gossip";

/// Application state shared with handlers
pub struct AppState<S: Storage> {
    pub chain_id: u64,
    pub chain: Arc<RwLock<ChainStore<S>>>,
    pub mempool: Arc<Mempool>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub consensus: RunnerHandle,
    /// Peers that receive relayed transactions
    pub peers: Vec<ValidatorEndpoint>,
    pub client: reqwest::Client,
}

// Response types

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub chain_id: u64,
    pub height: u64,
    pub head_block_hash: Option<String>,
    pub mempool_size: usize,
    pub consensus: EngineStatus,
}

#[derive(Debug, Serialize)]
pub struct TxSubmitResponse {
    pub hash: String,
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct BlockResponse {
    pub height: u64,
    pub hash: String,
    pub parent_hash: String,
    pub view: u64,
    pub epoch: u64,
    pub timestamp: u64,
    pub tx_count: usize,
    pub tx_hashes: Vec<String>,
    pub proposer: String,
    pub payload_hash: String,
    pub state_root: String,
    pub commit_qc_view: u64,
    pub commit_qc_signers: usize,
}

impl BlockResponse {
    fn from_committed(committed: &CommittedBlock) -> Result<Self, RpcError> {
        let block = &committed.block;
        let tx_hashes = committed
            .txs
            .iter()
            .map(|tx| tx.hash().map(|h| h.to_hex()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlockResponse {
            height: block.height,
            hash: block.hash()?.to_hex(),
            parent_hash: block.parent_hash.to_hex(),
            view: block.view,
            epoch: block.epoch,
            timestamp: block.timestamp,
            tx_count: committed.txs.len(),
            tx_hashes,
            proposer: block.proposer.to_hex(),
            payload_hash: block.payload_hash.to_hex(),
            state_root: committed.state_root.to_hex(),
            commit_qc_view: committed.commit_qc.view,
            commit_qc_signers: committed.commit_qc.signature_count(),
        })
    }
}

// Request types

#[derive(Debug, Serialize, Deserialize)]
pub struct TxSubmitRequest {
    pub transaction: Transaction,
}

/// GET /status - Chain head, pool size and engine state
pub async fn get_status<S: Storage + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<StatusResponse>, RpcError> {
    let head = state.chain.read().await.head()?;
    let mempool_size = state.mempool.size().await;

    let (height, head_block_hash) = match head {
        Some(committed) => (committed.height(), Some(committed.hash()?.to_hex())),
        None => (0, None),
    };

    Ok(Json(StatusResponse {
        chain_id: state.chain_id,
        height,
        head_block_hash,
        mempool_size,
        consensus: state.consensus.status(),
    }))
}

/// GET /block/:height - Get a committed block by height
pub async fn get_block<S: Storage + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(height): Path<u64>,
) -> Result<Json<BlockResponse>, RpcError> {
    let committed = state.chain.read().await.get_block(height)?;
    match committed {
        Some(committed) => Ok(Json(BlockResponse::from_committed(&committed)?)),
        None => Err(RpcError::NotFound(format!("Block at height {} not found", height))),
    }
}

/// GET /block/hash/:hash - Get a committed block by hash
pub async fn get_block_by_hash<S: Storage + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(hash_hex): Path<String>,
) -> Result<Json<BlockResponse>, RpcError> {
    let hash = Hash::from_hex(&hash_hex).map_err(|_| RpcError::BadRequest("Invalid block hash".to_string()))?;
    let committed = state.chain.read().await.get_block_by_hash(&hash)?;
    match committed {
        Some(committed) => Ok(Json(BlockResponse::from_committed(&committed)?)),
        None => Err(RpcError::NotFound(format!("Block {} not found", hash_hex))),
    }
}

/// POST /tx - Add a transaction to the pool and relay it to peers
pub async fn submit_tx<S: Storage + 'static>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    Json(request): Json<TxSubmitRequest>,
) -> Result<Json<TxSubmitResponse>, RpcError> {
    let tx = request.transaction;
    tx.verify_signature()?;

    let hash = tx.hash()?;
    let hash_hex = hash.to_hex();

    let is_gossip = headers
        .get(GOSSIP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "1")
        .unwrap_or(false);

    // Relayed duplicates are expected
    match state.mempool.add(tx.clone()).await {
        Ok(_) => {}
        Err(MempoolError::AlreadyExists) if is_gossip => {
            return Ok(Json(TxSubmitResponse {
                hash: hash_hex,
                status: "known".to_string(),
            }));
        }
        Err(e) => return Err(RpcError::Mempool(e)),
    }

    info!("Transaction {} submitted to mempool", hash.short());

    if !is_gossip && !state.peers.is_empty() {
        let peers = state.peers.clone();
        let client = state.client.clone();
        let body = TxSubmitRequest { transaction: tx };
        tokio::spawn(async move {
            for peer in peers {
                let url = format!("{}/tx", peer.address.trim_end_matches('/'));
                if let Err(e) = client.post(&url).header(GOSSIP_HEADER, "1").json(&body).send().await {
                    debug!("Relay to {} failed: {}", peer.pubkey.short(), e);
                }
            }
        });
    }

    Ok(Json(TxSubmitResponse {
        hash: hash_hex,
        status: "pending".to_string(),
    }))
}

/// POST /consensus/message - Hand a peer's consensus message to the engine.
/// Verification happens in the engine; this only queues.
pub async fn consensus_message<S: Storage + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(msg): Json<ConsensusMessage>,
) -> Result<Json<MessageAck>, RpcError> {
    let kind = msg.payload.kind();
    let sender = msg.sender.short();
    if let Err(e) = state.consensus.submit_message(msg) {
        warn!("Dropping {} from {}: {}", kind, sender, e);
        return Err(e.into());
    }
    Ok(Json(MessageAck { accepted: true }))
}
