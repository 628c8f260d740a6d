use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_core::{ConsensusMessage, PublicKey};
use tracing::warn;

use crate::error::ConsensusError;

/// Path peers accept consensus messages on
pub const MESSAGE_PATH: &str = "/consensus/message";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorEndpoint {
    pub pubkey: PublicKey,
    pub address: String,
}

impl ValidatorEndpoint {
    pub fn new(pubkey: PublicKey, address: String) -> Self {
        ValidatorEndpoint { pubkey, address }
    }
}

/// Reply to a delivered message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAck {
    pub accepted: bool,
}

/// Peer transport. Delivery is best effort; consensus tolerates loss.
#[async_trait]
pub trait Network: Send + Sync {
    /// Send to every other validator
    async fn broadcast(&self, msg: ConsensusMessage) -> Result<(), ConsensusError>;

    async fn send(&self, to: &PublicKey, msg: ConsensusMessage) -> Result<(), ConsensusError>;
}

/// Posts messages as JSON to each peer's HTTP endpoint
pub struct HttpNetwork {
    local: PublicKey,
    endpoints: HashMap<PublicKey, String>,
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new(local: PublicKey, endpoints: Vec<ValidatorEndpoint>, timeout: Duration) -> Result<Self, ConsensusError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConsensusError::ConfigurationFault(format!("http client: {}", e)))?;
        let endpoints = endpoints
            .into_iter()
            .map(|e| (e.pubkey, e.address.trim_end_matches('/').to_string()))
            .collect();
        Ok(HttpNetwork {
            local,
            endpoints,
            client,
        })
    }

    async fn post(&self, pubkey: &PublicKey, address: &str, msg: &ConsensusMessage) -> Result<(), ConsensusError> {
        let url = format!("{}{}", address, MESSAGE_PATH);
        let response = self
            .client
            .post(&url)
            .json(msg)
            .send()
            .await
            .map_err(|e| ConsensusError::Transport(format!("{}: {}", pubkey.short(), e)))?;

        if !response.status().is_success() {
            return Err(ConsensusError::Transport(format!(
                "{} rejected {}: {}",
                pubkey.short(),
                msg.payload.kind(),
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn broadcast(&self, msg: ConsensusMessage) -> Result<(), ConsensusError> {
        for (pubkey, address) in &self.endpoints {
            if pubkey == &self.local {
                continue;
            }
            if let Err(e) = self.post(pubkey, address, &msg).await {
                warn!("Failed to deliver {}: {}", msg.payload.kind(), e);
            }
        }
        Ok(())
    }

    async fn send(&self, to: &PublicKey, msg: ConsensusMessage) -> Result<(), ConsensusError> {
        let address = self
            .endpoints
            .get(to)
            .ok_or_else(|| ConsensusError::Transport(format!("no endpoint for {}", to.short())))?;
        self.post(to, address, &msg).await
    }
}
