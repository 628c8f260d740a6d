use tessera_core::ValidatorSet;
use tracing::{info, warn};

/// The active validator set plus the one it replaced, so certificates
/// formed just before a switch stay verifiable.
#[derive(Debug, Clone)]
pub struct EpochManager {
    current: ValidatorSet,
    previous: Option<ValidatorSet>,
    pending: Option<(ValidatorSet, u64)>,
}

impl EpochManager {
    pub fn new(initial: ValidatorSet) -> Self {
        EpochManager {
            current: initial,
            previous: None,
            pending: None,
        }
    }

    pub fn current(&self) -> &ValidatorSet {
        &self.current
    }

    pub fn epoch(&self) -> u64 {
        self.current.epoch
    }

    /// Look up the set that signs in `epoch`
    pub fn get(&self, epoch: u64) -> Option<&ValidatorSet> {
        if self.current.epoch == epoch {
            return Some(&self.current);
        }
        self.previous.as_ref().filter(|set| set.epoch == epoch)
    }

    /// Queue a set to take over once the committed height reaches
    /// `activation_height`. Only the next epoch can be scheduled.
    pub fn schedule(&mut self, set: ValidatorSet, activation_height: u64) -> bool {
        if set.epoch != self.current.epoch + 1 {
            warn!(
                "Ignoring validator set for epoch {} (current epoch {})",
                set.epoch, self.current.epoch
            );
            return false;
        }
        info!(
            "Scheduled validator set epoch {} ({} validators) at height {}",
            set.epoch,
            set.len(),
            activation_height
        );
        self.pending = Some((set, activation_height));
        true
    }

    /// Swap in the pending set if its activation height has been committed.
    /// Called at view boundaries only.
    pub fn maybe_activate(&mut self, committed_height: u64) -> bool {
        let ready = matches!(&self.pending, Some((_, h)) if committed_height >= *h);
        if !ready {
            return false;
        }
        if let Some((set, _)) = self.pending.take() {
            info!("Activated validator set epoch {}", set.epoch);
            let old = std::mem::replace(&mut self.current, set);
            self.previous = Some(old);
        }
        true
    }

    pub fn pending_epoch(&self) -> Option<u64> {
        self.pending.as_ref().map(|(set, _)| set.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{KeyPair, QuorumRule};

    fn set(epoch: u64, seeds: std::ops::Range<u64>) -> ValidatorSet {
        let ids = seeds.map(|i| KeyPair::from_seed(i).public).collect();
        ValidatorSet::uniform(epoch, ids, QuorumRule::Byzantine).unwrap()
    }

    #[test]
    fn test_activation_waits_for_height() {
        let mut epochs = EpochManager::new(set(0, 0..4));
        assert!(epochs.schedule(set(1, 1..5), 10));

        assert!(!epochs.maybe_activate(9));
        assert_eq!(epochs.epoch(), 0);

        assert!(epochs.maybe_activate(10));
        assert_eq!(epochs.epoch(), 1);
        assert!(epochs.get(0).is_some());
        assert!(epochs.get(1).is_some());
        assert!(epochs.pending_epoch().is_none());
    }

    #[test]
    fn test_rejects_epoch_gap() {
        let mut epochs = EpochManager::new(set(0, 0..4));
        assert!(!epochs.schedule(set(2, 0..4), 1));
        assert!(!epochs.maybe_activate(100));
    }
}
