//! Drives one engine: a single task owns it and consumes one event queue.
//! Network sends, batch fetches and execution run as spawned tasks whose
//! results come back through the queue; storage goes through one ordered
//! commit worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tessera_core::{CommittedBlock, ConsensusMessage, Hash, MessagePayload, ValidatorSet};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{Action, CoreEngine, EngineStatus, Event, TimeoutKind};
use crate::error::ConsensusError;
use crate::events::BlockEventSink;
use crate::execution::BlockExecutor;
use crate::net::Network;
use crate::pool::TxPool;
use crate::store::BlockStore;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Capacity of the event queue; peers see back-pressure beyond it
    pub queue_capacity: usize,
    /// Upper bound on one storage commit
    pub commit_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            queue_capacity: 4096,
            commit_timeout: Duration::from_secs(10),
        }
    }
}

/// The engine's outside world
#[derive(Clone)]
pub struct Collaborators {
    pub network: Arc<dyn Network>,
    pub pool: Arc<dyn TxPool>,
    pub executor: Arc<dyn BlockExecutor>,
    pub store: Arc<dyn BlockStore>,
    pub sinks: Vec<Arc<dyn BlockEventSink>>,
}

/// Cloneable access to a running engine
#[derive(Clone)]
pub struct RunnerHandle {
    events: mpsc::Sender<Event>,
    status: watch::Receiver<EngineStatus>,
}

impl RunnerHandle {
    /// Queue a peer message without waiting. Fails when the queue is full
    /// or the runner has stopped.
    pub fn submit_message(&self, msg: ConsensusMessage) -> Result<(), ConsensusError> {
        self.events.try_send(Event::Message(msg)).map_err(|e| match e {
            TrySendError::Full(_) => ConsensusError::Transport("consensus queue full".into()),
            TrySendError::Closed(_) => ConsensusError::Transport("consensus stopped".into()),
        })
    }

    pub async fn update_validator_set(&self, set: ValidatorSet, activation_height: u64) -> Result<(), ConsensusError> {
        self.events
            .send(Event::ValidatorSetUpdate { set, activation_height })
            .await
            .map_err(|_| ConsensusError::Transport("consensus stopped".into()))
    }

    pub async fn stop(&self) {
        let _ = self.events.send(Event::Stop).await;
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }
}

pub struct ConsensusRunner {
    engine: Box<dyn CoreEngine>,
    collaborators: Collaborators,
    config: RunnerConfig,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    status_tx: watch::Sender<EngineStatus>,
    timers: HashMap<TimeoutKind, JoinHandle<()>>,
}

impl ConsensusRunner {
    pub fn new(engine: Box<dyn CoreEngine>, collaborators: Collaborators, config: RunnerConfig) -> (Self, RunnerHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(engine.status());
        let handle = RunnerHandle {
            events: events_tx.clone(),
            status: status_rx,
        };
        let runner = ConsensusRunner {
            engine,
            collaborators,
            config,
            events_tx,
            events_rx,
            status_tx,
            timers: HashMap::new(),
        };
        (runner, handle)
    }

    /// Build and spawn onto the current runtime
    pub fn spawn(engine: Box<dyn CoreEngine>, collaborators: Collaborators, config: RunnerConfig) -> (RunnerHandle, JoinHandle<()>) {
        let (runner, handle) = Self::new(engine, collaborators, config);
        (handle, tokio::spawn(runner.run()))
    }

    pub async fn run(mut self) {
        info!("Consensus runner started ({})", self.engine.kind());
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let commit_worker = tokio::spawn(commit_worker(
            Arc::clone(&self.collaborators.store),
            Arc::clone(&self.collaborators.pool),
            commit_rx,
            self.events_tx.clone(),
            self.config.commit_timeout,
        ));
        let pool_watcher = tokio::spawn(watch_pool(
            Arc::clone(&self.collaborators.pool),
            self.events_tx.clone(),
        ));

        self.dispatch(Event::Start, &commit_tx).await;
        while let Some(event) = self.events_rx.recv().await {
            let stop = matches!(event, Event::Stop);
            self.dispatch(event, &commit_tx).await;
            if stop {
                break;
            }
        }

        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        pool_watcher.abort();
        // Let queued commits finish; their completions have nowhere to go
        self.events_rx.close();
        drop(commit_tx);
        if let Err(e) = commit_worker.await {
            error!("Commit worker failed: {}", e);
        }
        info!("Consensus runner stopped");
    }

    async fn dispatch(&mut self, event: Event, commit_tx: &mpsc::UnboundedSender<CommittedBlock>) {
        let actions = self.engine.handle(event);
        let mut votes_blocked = false;
        for action in actions {
            match action {
                Action::PersistSafety(state) => {
                    let store = Arc::clone(&self.collaborators.store);
                    if let Err(e) = store.save_safety_state(&state).await {
                        error!("Failed to persist safety state, withholding votes: {}", e);
                        votes_blocked = true;
                    }
                }
                Action::Broadcast(msg) | Action::Send { message: msg, .. } if votes_blocked && is_vote(&msg) => {
                    warn!("Dropped {} for view {}", msg.payload.kind(), msg.view);
                }
                other => self.perform(other, commit_tx),
            }
        }
        self.status_tx.send_replace(self.engine.status());
    }

    fn perform(&mut self, action: Action, commit_tx: &mpsc::UnboundedSender<CommittedBlock>) {
        match action {
            Action::Broadcast(msg) => {
                let network = Arc::clone(&self.collaborators.network);
                tokio::spawn(async move {
                    if let Err(e) = network.broadcast(msg).await {
                        warn!("Broadcast failed: {}", e);
                    }
                });
            }
            Action::Send { to, message } => {
                let network = Arc::clone(&self.collaborators.network);
                tokio::spawn(async move {
                    if let Err(e) = network.send(&to, message).await {
                        debug!("Send to {} failed: {}", to.short(), e);
                    }
                });
            }
            Action::ScheduleTimeout { view, kind, duration } => {
                if let Some(previous) = self.timers.remove(&kind) {
                    previous.abort();
                }
                let events = self.events_tx.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    let _ = events.send(Event::LocalTimeout { view, kind }).await;
                });
                self.timers.insert(kind, timer);
            }
            Action::FetchBatch {
                view,
                max_count,
                max_bytes,
            } => {
                let pool = Arc::clone(&self.collaborators.pool);
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let txs = pool.fetch_batch(max_count, max_bytes).await;
                    let _ = events.send(Event::BatchReady { view, txs }).await;
                });
            }
            Action::Execute { block, txs } => {
                let block_hash = match block.hash() {
                    Ok(hash) => hash,
                    Err(e) => {
                        error!("Cannot hash block at height {}: {}", block.height, e);
                        return;
                    }
                };
                let executor = Arc::clone(&self.collaborators.executor);
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let outcome = executor.execute(&block, &txs).await.map_err(|e| e.to_string());
                    let _ = events.send(Event::ExecutionCompleted { block_hash, outcome }).await;
                });
            }
            Action::Commit(committed) => {
                if commit_tx.send(committed).is_err() {
                    error!("Commit worker is gone");
                }
            }
            Action::Publish(event) => {
                for sink in &self.collaborators.sinks {
                    sink.publish(&event);
                }
            }
            Action::PersistSafety(_) => {}
        }
    }
}

fn is_vote(msg: &ConsensusMessage) -> bool {
    matches!(msg.payload, MessagePayload::Vote(_) | MessagePayload::Timeout(_))
}

/// Stores committed blocks strictly in the order they were decided
async fn commit_worker(
    store: Arc<dyn BlockStore>,
    pool: Arc<dyn TxPool>,
    mut blocks: mpsc::UnboundedReceiver<CommittedBlock>,
    events: mpsc::Sender<Event>,
    commit_timeout: Duration,
) {
    while let Some(committed) = blocks.recv().await {
        let height = committed.height();
        let block_hash = match committed.hash() {
            Ok(hash) => hash,
            Err(e) => {
                error!("Cannot hash committed block at height {}: {}", height, e);
                continue;
            }
        };

        let result = match tokio::time::timeout(commit_timeout, store.commit_block(&committed)).await {
            Ok(Ok(())) => {
                let tx_hashes: Vec<Hash> = committed.txs.iter().filter_map(|tx| tx.hash().ok()).collect();
                pool.remove_committed(&tx_hashes).await;
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("storage did not answer within {:?}", commit_timeout)),
        };
        if events
            .send(Event::CommitCompleted {
                height,
                block_hash,
                result,
            })
            .await
            .is_err()
        {
            debug!("Runner stopped, commit worker draining");
        }
    }
}

async fn watch_pool(pool: Arc<dyn TxPool>, events: mpsc::Sender<Event>) {
    loop {
        pool.wait_ready().await;
        if events.send(Event::TxPoolReady).await.is_err() {
            break;
        }
    }
}
