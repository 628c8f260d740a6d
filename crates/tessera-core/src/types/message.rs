use serde::{Deserialize, Serialize};

use crate::crypto::{sign, verify, Hash, KeyPair, PublicKey, Sig};
use crate::error::CoreError;
use crate::serialize;
use crate::types::block::Proposal;
use crate::types::qc::QuorumCertificate;
use crate::types::timeout::TimeoutMsg;
use crate::types::vote::Vote;

/// Everything replicas say to each other
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    Proposal(Proposal),
    Vote(Vote),
    Timeout(TimeoutMsg),
    QcGossip(QuorumCertificate),
    BlockRequest { block_hash: Hash },
    BlockResponse(Option<Proposal>),
}

impl MessagePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            MessagePayload::Proposal(_) => "proposal",
            MessagePayload::Vote(_) => "vote",
            MessagePayload::Timeout(_) => "timeout",
            MessagePayload::QcGossip(_) => "qc",
            MessagePayload::BlockRequest { .. } => "block_request",
            MessagePayload::BlockResponse(_) => "block_response",
        }
    }
}

#[derive(Serialize)]
struct EnvelopeSigningData<'a> {
    view: u64,
    sender: &'a PublicKey,
    payload: &'a MessagePayload,
}

/// Signed envelope around a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub view: u64,
    pub sender: PublicKey,
    pub payload: MessagePayload,
    pub signature: Sig,
}

impl ConsensusMessage {
    pub fn new_signed(view: u64, payload: MessagePayload, keypair: &KeyPair) -> Result<Self, CoreError> {
        let digest = Self::signing_digest(view, &keypair.public, &payload)?;
        let signature = sign(&keypair.secret, digest.as_bytes());
        Ok(ConsensusMessage {
            view,
            sender: keypair.public,
            payload,
            signature,
        })
    }

    fn signing_digest(view: u64, sender: &PublicKey, payload: &MessagePayload) -> Result<Hash, CoreError> {
        serialize::digest(&EnvelopeSigningData {
            view,
            sender,
            payload,
        })
    }

    /// Verify the envelope signature against the claimed sender
    pub fn verify_signature(&self) -> Result<(), CoreError> {
        let digest = Self::signing_digest(self.view, &self.sender, &self.payload)?;
        verify(&self.sender, digest.as_bytes(), &self.signature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        serialize::to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        serialize::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash_blake3;
    use crate::types::vote::VotePhase;

    #[test]
    fn test_envelope_rejects_forged_sender() {
        let kp = KeyPair::from_seed(1);
        let payload = MessagePayload::BlockRequest {
            block_hash: hash_blake3(b"x"),
        };
        let mut msg = ConsensusMessage::new_signed(4, payload, &kp).unwrap();
        assert!(msg.verify_signature().is_ok());

        msg.sender = KeyPair::from_seed(2).public;
        assert!(msg.verify_signature().is_err());
    }

    #[test]
    fn test_envelope_survives_the_wire() {
        let kp = KeyPair::from_seed(1);
        let vote = Vote::new_signed(hash_blake3(b"b"), 2, 1, VotePhase::Generic, 0, &kp).unwrap();
        let msg = ConsensusMessage::new_signed(2, MessagePayload::Vote(vote), &kp).unwrap();

        let decoded = ConsensusMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert!(decoded.verify_signature().is_ok());
        assert_eq!(decoded.payload.kind(), "vote");

        let json = serialize::to_json(&msg).unwrap();
        let from_json: ConsensusMessage = serialize::from_json(&json).unwrap();
        assert_eq!(from_json, msg);
    }
}
