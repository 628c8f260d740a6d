use tessera_core::{verify, Hash, QuorumCertificate, TimeoutCertificate, TimeoutData, ValidatorSet};

use crate::epoch::EpochManager;
use crate::error::ConsensusError;

/// Check signer order, membership and combined weight. Signers must appear
/// in strictly increasing validator index, which also rules out repeats.
fn check_signers<'a, I>(set: &ValidatorSet, signers: I) -> Result<(), ConsensusError>
where
    I: IntoIterator<Item = &'a tessera_core::PublicKey>,
{
    let mut last_index: Option<usize> = None;
    let mut weight = 0u64;

    for signer in signers {
        let index = set
            .index_of(signer)
            .ok_or_else(|| ConsensusError::malformed(format!("signer {} not in set", signer.short())))?;
        if last_index.is_some_and(|last| index <= last) {
            return Err(ConsensusError::malformed("signers out of order or repeated"));
        }
        last_index = Some(index);
        weight += set.weight_of(signer).unwrap_or(0);
    }

    let threshold = set.quorum_threshold();
    if weight < threshold {
        return Err(ConsensusError::malformed(format!(
            "insufficient weight: have {}, need {}",
            weight, threshold
        )));
    }
    Ok(())
}

/// Verify a quorum certificate against the validator set of its epoch.
///
/// The unsigned genesis certificate is accepted only when it certifies
/// `genesis_hash`.
pub fn verify_qc(
    qc: &QuorumCertificate,
    epochs: &EpochManager,
    genesis_hash: &Hash,
) -> Result<(), ConsensusError> {
    if qc.is_genesis() {
        if &qc.block_hash == genesis_hash {
            return Ok(());
        }
        return Err(ConsensusError::malformed("genesis certificate for non-genesis block"));
    }

    let set = epochs
        .get(qc.epoch)
        .ok_or_else(|| ConsensusError::malformed(format!("unknown epoch {}", qc.epoch)))?;

    check_signers(set, qc.signers())?;

    let message = qc.vote_data().signing_bytes()?;
    for vs in &qc.signatures {
        verify(&vs.validator_pubkey, &message, &vs.signature)
            .map_err(|_| ConsensusError::malformed(format!("bad signature from {}", vs.validator_pubkey.short())))?;
    }
    Ok(())
}

/// Verify a timeout certificate and the high QC it carries
pub fn verify_tc(
    tc: &TimeoutCertificate,
    epochs: &EpochManager,
    genesis_hash: &Hash,
) -> Result<(), ConsensusError> {
    let set = epochs
        .get(tc.epoch)
        .ok_or_else(|| ConsensusError::malformed(format!("unknown epoch {}", tc.epoch)))?;

    check_signers(set, tc.signers())?;

    let highest = tc.signatures.iter().map(|s| s.high_qc_view).max().unwrap_or(0);
    if tc.high_qc.view != highest {
        return Err(ConsensusError::malformed(format!(
            "timeout certificate carries QC for view {}, signers reported {}",
            tc.high_qc.view, highest
        )));
    }

    for ts in &tc.signatures {
        let data = TimeoutData {
            view: tc.view,
            epoch: tc.epoch,
            high_qc_view: ts.high_qc_view,
        };
        verify(&ts.validator_pubkey, &data.signing_bytes()?, &ts.signature)
            .map_err(|_| ConsensusError::malformed(format!("bad timeout signature from {}", ts.validator_pubkey.short())))?;
    }

    verify_qc(&tc.high_qc, epochs, genesis_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{
        hash_blake3, sign, KeyPair, QuorumRule, TimeoutMsg, TimeoutSignature, ValidatorInfo,
        ValidatorSignature, Vote, VotePhase,
    };

    fn keys(n: u64) -> Vec<KeyPair> {
        (0..n).map(KeyPair::from_seed).collect()
    }

    fn epochs_for(kps: &[KeyPair]) -> EpochManager {
        let ids = kps.iter().map(|k| k.public).collect();
        EpochManager::new(ValidatorSet::uniform(0, ids, QuorumRule::Byzantine).unwrap())
    }

    fn qc_from(kps: &[KeyPair], block_hash: Hash, view: u64) -> QuorumCertificate {
        let signatures = kps
            .iter()
            .map(|kp| {
                let vote = Vote::new_signed(block_hash, view, 1, VotePhase::Generic, 0, kp).unwrap();
                ValidatorSignature {
                    validator_pubkey: kp.public,
                    signature: vote.signature,
                }
            })
            .collect();
        QuorumCertificate {
            block_hash,
            view,
            height: 1,
            phase: VotePhase::Generic,
            epoch: 0,
            signatures,
        }
    }

    #[test]
    fn test_verify_qc_accepts_quorum() {
        let kps = keys(4);
        let epochs = epochs_for(&kps);
        let qc = qc_from(&kps[..3], hash_blake3(b"b1"), 1);
        verify_qc(&qc, &epochs, &Hash::ZERO).unwrap();
    }

    #[test]
    fn test_verify_qc_rejects_short_quorum() {
        let kps = keys(4);
        let epochs = epochs_for(&kps);
        let qc = qc_from(&kps[..2], hash_blake3(b"b1"), 1);
        assert!(matches!(
            verify_qc(&qc, &epochs, &Hash::ZERO),
            Err(ConsensusError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_verify_qc_rejects_repeated_signer() {
        let kps = keys(4);
        let epochs = epochs_for(&kps);
        let mut qc = qc_from(&kps[..3], hash_blake3(b"b1"), 1);
        qc.signatures[2] = qc.signatures[1].clone();
        assert!(verify_qc(&qc, &epochs, &Hash::ZERO).is_err());
    }

    #[test]
    fn test_verify_qc_rejects_outsider_and_tampering() {
        let kps = keys(5);
        let epochs = epochs_for(&kps[..4]);
        let outsider = qc_from(&[kps[0].clone(), kps[1].clone(), kps[4].clone()], hash_blake3(b"b1"), 1);
        assert!(verify_qc(&outsider, &epochs, &Hash::ZERO).is_err());

        let mut tampered = qc_from(&kps[..3], hash_blake3(b"b1"), 1);
        tampered.view = 2;
        assert!(verify_qc(&tampered, &epochs, &Hash::ZERO).is_err());
    }

    #[test]
    fn test_weighted_qc_uses_weight_not_count() {
        let kps = keys(3);
        let set = ValidatorSet::new(
            0,
            vec![
                ValidatorInfo::new(kps[0].public, 6),
                ValidatorInfo::new(kps[1].public, 2),
                ValidatorInfo::new(kps[2].public, 2),
            ],
            QuorumRule::Byzantine,
        )
        .unwrap();
        let epochs = EpochManager::new(set);

        let heavy = qc_from(&[kps[0].clone(), kps[1].clone()], hash_blake3(b"b"), 1);
        verify_qc(&heavy, &epochs, &Hash::ZERO).unwrap();

        let light = qc_from(&[kps[1].clone(), kps[2].clone()], hash_blake3(b"b"), 1);
        assert!(verify_qc(&light, &epochs, &Hash::ZERO).is_err());
    }

    #[test]
    fn test_genesis_qc_only_for_genesis() {
        let kps = keys(4);
        let epochs = epochs_for(&kps);
        let genesis_hash = hash_blake3(b"genesis");

        verify_qc(&QuorumCertificate::genesis(genesis_hash), &epochs, &genesis_hash).unwrap();
        assert!(verify_qc(&QuorumCertificate::genesis(hash_blake3(b"other")), &epochs, &genesis_hash).is_err());
    }

    #[test]
    fn test_verify_tc() {
        let kps = keys(4);
        let epochs = epochs_for(&kps);
        let genesis_hash = hash_blake3(b"genesis");
        let high_qc = qc_from(&kps[..3], hash_blake3(b"b1"), 1);

        let signatures: Vec<TimeoutSignature> = kps[..3]
            .iter()
            .enumerate()
            .map(|(i, kp)| {
                let reported = if i == 0 {
                    high_qc.clone()
                } else {
                    QuorumCertificate::genesis(genesis_hash)
                };
                let msg = TimeoutMsg::new_signed(3, 0, reported, kp).unwrap();
                TimeoutSignature {
                    validator_pubkey: kp.public,
                    high_qc_view: msg.high_qc.view,
                    signature: msg.signature,
                }
            })
            .collect();

        let tc = TimeoutCertificate {
            view: 3,
            epoch: 0,
            high_qc: high_qc.clone(),
            signatures: signatures.clone(),
        };
        verify_tc(&tc, &epochs, &genesis_hash).unwrap();

        // Carrying a lower QC than reported is rejected
        let lowered = TimeoutCertificate {
            high_qc: QuorumCertificate::genesis(genesis_hash),
            ..tc.clone()
        };
        assert!(verify_tc(&lowered, &epochs, &genesis_hash).is_err());

        // Signature over a different view is rejected
        let mut forged = tc;
        forged.signatures[1].signature = sign(&kps[1].secret, b"not a timeout");
        assert!(verify_tc(&forged, &epochs, &genesis_hash).is_err());
    }
}
