pub mod block;
pub mod message;
pub mod qc;
pub mod timeout;
pub mod transaction;
pub mod validator;
pub mod vote;

pub use block::{Block, CommittedBlock, GenesisConfig, Proposal};
pub use message::{ConsensusMessage, MessagePayload};
pub use qc::{QuorumCertificate, ValidatorSignature};
pub use timeout::{TimeoutCertificate, TimeoutData, TimeoutMsg, TimeoutSignature};
pub use transaction::Transaction;
pub use validator::{QuorumRule, ValidatorInfo, ValidatorSet};
pub use vote::{Vote, VoteData, VotePhase};
