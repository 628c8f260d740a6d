use std::fmt;

use serde::{Deserialize, Serialize};
use tessera_core::QuorumCertificate;

/// Low bits of a TBFT view hold the round, high bits the height
pub const ROUND_BITS: u32 = 20;
pub const MAX_ROUND: u64 = (1 << ROUND_BITS) - 1;

/// Map `(height, round)` onto one strictly increasing view number. Rounds
/// past `MAX_ROUND` saturate, so the engine never enters one.
pub fn encode_view(height: u64, round: u64) -> u64 {
    (height << ROUND_BITS) | round.min(MAX_ROUND)
}

pub fn decode_view(view: u64) -> (u64, u64) {
    (view >> ROUND_BITS, view & MAX_ROUND)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    NewHeight,
    Propose,
    Prevote,
    Precommit,
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::NewHeight => write!(f, "new-height"),
            Step::Propose => write!(f, "propose"),
            Step::Prevote => write!(f, "prevote"),
            Step::Precommit => write!(f, "precommit"),
            Step::Commit => write!(f, "commit"),
        }
    }
}

/// Per-round progress. Reset whenever the round or height changes.
#[derive(Debug, Clone)]
pub struct RoundState {
    pub height: u64,
    pub round: u64,
    pub step: Step,
    pub prevoted: bool,
    pub precommitted: bool,
    pub prevote_timer: bool,
    pub precommit_timer: bool,
    /// Prevote quorum formed in this round, block or nil
    pub polka: Option<QuorumCertificate>,
}

impl RoundState {
    pub fn new(height: u64, round: u64) -> Self {
        RoundState {
            height,
            round,
            step: Step::NewHeight,
            prevoted: false,
            precommitted: false,
            prevote_timer: false,
            precommit_timer: false,
            polka: None,
        }
    }

    pub fn view(&self) -> u64 {
        encode_view(self.height, self.round)
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_increase_with_height_and_round() {
        assert!(encode_view(1, 5) < encode_view(2, 0));
        assert!(encode_view(3, 0) < encode_view(3, 1));
        assert_eq!(decode_view(encode_view(42, 7)), (42, 7));
    }

    #[test]
    fn test_round_saturates() {
        assert_eq!(decode_view(encode_view(1, u64::MAX)), (1, MAX_ROUND));
    }
}
