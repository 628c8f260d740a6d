use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tessera_consensus::{
    BlockStore, Collaborators, ConsensusRunner, DigestExecutor, EngineConfig, EngineRegistry, HttpNetwork,
    RunnerConfig,
};
use tessera_core::{GenesisConfig, KeyPair};
use tessera_mempool::{Mempool, MempoolConfig};
use tessera_rpc::ws::EventBroadcaster;
use tessera_rpc::{RpcConfig, RpcContext, RpcServer};
use tessera_state::{ChainStore, CommitOutcome, FileStorage};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::config::NodeConfig;

const CHAIN_FILE: &str = "chain.bin";

/// A validator: one consensus engine plus its storage, pool and RPC surface
pub struct Node {
    config: NodeConfig,
    registry: EngineRegistry,
    keypair: KeyPair,
    genesis: GenesisConfig,
    chain: Arc<RwLock<ChainStore<FileStorage>>>,
    mempool: Arc<Mempool>,
    broadcaster: Arc<EventBroadcaster>,
}

impl Node {
    /// Open storage and check the configuration. The engine itself is
    /// built in `run`, from whatever storage recovered.
    pub fn new(config: NodeConfig, registry: EngineRegistry) -> Result<Self> {
        let keypair = config.keypair()?;
        let genesis = config.to_genesis_config()?;

        if !registry.contains(&config.consensus) {
            return Err(anyhow!(
                "unknown consensus engine {:?} (available: {})",
                config.consensus,
                registry.names().join(", ")
            ));
        }

        let storage = FileStorage::new(config.data_dir.join(CHAIN_FILE))?;
        let mut chain = ChainStore::open(storage)?;
        if chain.initialize(&genesis.create_genesis_block())? == CommitOutcome::Stored {
            info!("Genesis block stored for chain {}", genesis.chain_id);
        }

        let mempool_config = MempoolConfig {
            max_size: config.mempool_max_size,
            max_per_sender: config.mempool_max_per_sender,
            ..Default::default()
        };

        Ok(Node {
            keypair,
            genesis,
            registry,
            chain: Arc::new(RwLock::new(chain)),
            mempool: Arc::new(Mempool::new(mempool_config)),
            broadcaster: Arc::new(EventBroadcaster::default()),
            config,
        })
    }

    /// Engine settings, resuming from the stored head and voting record
    async fn engine_config(&self) -> Result<EngineConfig> {
        let safety_state = self.chain.load_safety_state().await?;
        let committed_head = self.chain.read().await.head()?;
        if let Some(head) = &committed_head {
            info!("Resuming above height {}", head.height());
        }

        Ok(EngineConfig {
            timeouts: self.config.timeouts,
            leader_rotation: self.config.leader_rotation,
            max_batch_txs: self.config.max_batch_txs,
            max_batch_bytes: self.config.max_batch_bytes,
            safety_state,
            committed_head,
            ..EngineConfig::new(self.keypair.clone(), self.genesis.clone())
        })
    }

    /// Run consensus and the RPC server until the server stops or the
    /// process is interrupted
    pub async fn run(self) -> Result<()> {
        info!(
            "Starting {} validator {}",
            self.config.consensus.to_ascii_uppercase(),
            self.keypair.public.short()
        );

        let engine = self
            .registry
            .build(&self.config.consensus, self.engine_config().await?)?;

        let peers = self.config.peer_endpoints(&self.keypair.public)?;
        let network = HttpNetwork::new(
            self.keypair.public,
            peers.clone(),
            Duration::from_millis(self.config.peer_timeout_ms),
        )?;

        let collaborators = Collaborators {
            network: Arc::new(network),
            pool: self.mempool.clone(),
            executor: Arc::new(DigestExecutor),
            store: self.chain.clone(),
            sinks: vec![self.broadcaster.clone()],
        };
        let (handle, consensus_task) = ConsensusRunner::spawn(engine, collaborators, RunnerConfig::default());

        let rpc_config = RpcConfig {
            http_addr: self.config.rpc_addr,
            enable_ws: self.config.enable_ws,
        };
        let rpc_server = RpcServer::new(
            rpc_config,
            RpcContext {
                chain_id: self.config.chain_id,
                chain: Arc::clone(&self.chain),
                mempool: Arc::clone(&self.mempool),
                broadcaster: Arc::clone(&self.broadcaster),
                consensus: handle.clone(),
                peers,
            },
        );

        tokio::select! {
            result = rpc_server.run() => {
                if let Err(e) = result {
                    error!("RPC server error: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
            }
        }

        handle.stop().await;
        consensus_task.await?;
        info!("Node stopped");
        Ok(())
    }
}
