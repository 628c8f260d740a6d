use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConsensusError;

/// Cap on the doubling exponent so backoff stays bounded
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// How the view timeout grows over consecutive timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// `base * 2^k`, capped at `max_ms`
    Exponential { base_ms: u64, max_ms: u64 },
    /// `base + step * k`, capped at `max_ms`
    Linear { base_ms: u64, step_ms: u64, max_ms: u64 },
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Exponential {
            base_ms: 1000,
            max_ms: 30_000,
        }
    }
}

impl TimeoutPolicy {
    pub fn duration(&self, consecutive_timeouts: u32) -> Duration {
        let ms = match *self {
            TimeoutPolicy::Exponential { base_ms, max_ms } => {
                let factor = 1u64 << consecutive_timeouts.min(MAX_BACKOFF_EXPONENT);
                base_ms.saturating_mul(factor).min(max_ms)
            }
            TimeoutPolicy::Linear {
                base_ms,
                step_ms,
                max_ms,
            } => base_ms
                .saturating_add(step_ms.saturating_mul(consecutive_timeouts as u64))
                .min(max_ms),
        };
        Duration::from_millis(ms)
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        let (base_ms, max_ms) = match *self {
            TimeoutPolicy::Exponential { base_ms, max_ms } => (base_ms, max_ms),
            TimeoutPolicy::Linear { base_ms, max_ms, .. } => (base_ms, max_ms),
        };
        if base_ms == 0 {
            return Err(ConsensusError::ConfigurationFault(
                "view timeout must be positive".into(),
            ));
        }
        if max_ms < base_ms {
            return Err(ConsensusError::ConfigurationFault(format!(
                "max timeout {}ms below base {}ms",
                max_ms, base_ms
            )));
        }
        Ok(())
    }
}

/// Evidence that a view is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewCertificate {
    /// A QC was formed in the view
    Quorum(u64),
    /// A timeout certificate was formed for the view
    Timeout(u64),
}

impl ViewCertificate {
    pub fn view(&self) -> u64 {
        match self {
            ViewCertificate::Quorum(view) | ViewCertificate::Timeout(view) => *view,
        }
    }
}

/// View progression and timeout backoff
#[derive(Debug, Clone)]
pub struct Pacemaker {
    current_view: u64,
    consecutive_timeouts: u32,
    policy: TimeoutPolicy,
}

impl Pacemaker {
    pub fn new(policy: TimeoutPolicy, start_view: u64) -> Self {
        Pacemaker {
            current_view: start_view,
            consecutive_timeouts: 0,
            policy,
        }
    }

    pub fn current_view(&self) -> u64 {
        self.current_view
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Timeout for the current view under the backoff policy
    pub fn current_timeout(&self) -> Duration {
        self.policy.duration(self.consecutive_timeouts)
    }

    /// Move to `cert.view() + 1` if the certificate is not behind us.
    /// Returns whether the view changed.
    pub fn advance_view(&mut self, cert: ViewCertificate) -> bool {
        let view = cert.view();
        if view < self.current_view {
            return false;
        }
        match cert {
            ViewCertificate::Quorum(_) => self.consecutive_timeouts = 0,
            ViewCertificate::Timeout(_) => {
                self.consecutive_timeouts = self.consecutive_timeouts.saturating_add(1)
            }
        }
        self.current_view = view + 1;
        debug!(
            "Advanced to view {} ({} consecutive timeouts)",
            self.current_view, self.consecutive_timeouts
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = TimeoutPolicy::Exponential {
            base_ms: 100,
            max_ms: 1000,
        };
        assert_eq!(policy.duration(0), Duration::from_millis(100));
        assert_eq!(policy.duration(1), Duration::from_millis(200));
        assert_eq!(policy.duration(3), Duration::from_millis(800));
        assert_eq!(policy.duration(4), Duration::from_millis(1000));
        assert_eq!(policy.duration(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = TimeoutPolicy::Linear {
            base_ms: 100,
            step_ms: 50,
            max_ms: 300,
        };
        assert_eq!(policy.duration(0), Duration::from_millis(100));
        assert_eq!(policy.duration(2), Duration::from_millis(200));
        assert_eq!(policy.duration(10), Duration::from_millis(300));
    }

    #[test]
    fn test_invalid_policy() {
        assert!(TimeoutPolicy::Exponential { base_ms: 0, max_ms: 10 }.validate().is_err());
        assert!(TimeoutPolicy::Linear { base_ms: 10, step_ms: 1, max_ms: 5 }
            .validate()
            .unwrap_err()
            .is_fatal());
        assert!(TimeoutPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_advance_view_rules() {
        let mut pm = Pacemaker::new(TimeoutPolicy::default(), 1);

        assert!(pm.advance_view(ViewCertificate::Timeout(1)));
        assert_eq!(pm.current_view(), 2);
        assert_eq!(pm.consecutive_timeouts(), 1);

        assert!(pm.advance_view(ViewCertificate::Timeout(2)));
        assert_eq!(pm.consecutive_timeouts(), 2);
        assert_eq!(pm.current_timeout(), Duration::from_millis(4000));

        // Certificates for past views are ignored
        assert!(!pm.advance_view(ViewCertificate::Quorum(1)));
        assert_eq!(pm.current_view(), 3);

        // A future QC jumps ahead and resets the backoff
        assert!(pm.advance_view(ViewCertificate::Quorum(7)));
        assert_eq!(pm.current_view(), 8);
        assert_eq!(pm.consecutive_timeouts(), 0);
    }

    #[test]
    fn test_policy_json() {
        let json = r#"{"kind":"linear","base_ms":500,"step_ms":250,"max_ms":5000}"#;
        let policy: TimeoutPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(
            policy,
            TimeoutPolicy::Linear {
                base_ms: 500,
                step_ms: 250,
                max_ms: 5000
            }
        );
    }
}
