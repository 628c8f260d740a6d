use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::{CoreEngine, EngineConfig};
use crate::error::ConsensusError;
use crate::hotstuff::HotStuffEngine;
use crate::solo::SoloEngine;
use crate::tbft::TbftEngine;

/// The protocols this crate ships
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    #[default]
    HotStuff,
    Tbft,
    Solo,
}

impl ConsensusKind {
    /// Registry name
    pub fn name(&self) -> &'static str {
        match self {
            ConsensusKind::HotStuff => "HOTSTUFF",
            ConsensusKind::Tbft => "TBFT",
            ConsensusKind::Solo => "SOLO",
        }
    }
}

impl fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

pub type EngineConstructor = fn(EngineConfig) -> Result<Box<dyn CoreEngine>, ConsensusError>;

fn build_hotstuff(config: EngineConfig) -> Result<Box<dyn CoreEngine>, ConsensusError> {
    Ok(Box::new(HotStuffEngine::new(config)?))
}

fn build_tbft(config: EngineConfig) -> Result<Box<dyn CoreEngine>, ConsensusError> {
    Ok(Box::new(TbftEngine::new(config)?))
}

fn build_solo(config: EngineConfig) -> Result<Box<dyn CoreEngine>, ConsensusError> {
    Ok(Box::new(SoloEngine::new(config)?))
}

/// Name to constructor table, built once at startup and handed to the node
#[derive(Clone, Default)]
pub struct EngineRegistry {
    constructors: BTreeMap<String, EngineConstructor>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HotStuff, TBFT and SOLO. `RAFT` and `DPOS` are kept as names for
    /// TBFT; DPoS validators come from genesis weights.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ConsensusKind::HotStuff.name(), build_hotstuff);
        registry.register(ConsensusKind::Tbft.name(), build_tbft);
        registry.register(ConsensusKind::Solo.name(), build_solo);
        registry.register("RAFT", build_tbft);
        registry.register("DPOS", build_tbft);
        registry
    }

    /// Names are case-insensitive. Returns false if `name` replaced an
    /// earlier registration.
    pub fn register(&mut self, name: &str, constructor: EngineConstructor) -> bool {
        self.constructors
            .insert(name.to_ascii_uppercase(), constructor)
            .is_none()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(&name.to_ascii_uppercase())
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn build(&self, name: &str, config: EngineConfig) -> Result<Box<dyn CoreEngine>, ConsensusError> {
        let constructor = self.constructors.get(&name.to_ascii_uppercase()).ok_or_else(|| {
            ConsensusError::ConfigurationFault(format!(
                "unknown consensus engine {:?} (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;
        constructor(config)
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.names())
            .finish()
    }
}
