//! Coordinator configuration

use std::time::Duration;

use meridian_core::Slot;
use rand::Rng;

use crate::pipeline::StageConfig;

/// The three stages a commit attempt moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prepare,
    Accept,
    Respond,
}

/// Configuration for exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial backoff duration
    pub initial: Duration,
    /// Maximum backoff duration
    pub max: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Backoff duration for a given retry count, with 50% to 150% jitter
    #[must_use]
    pub fn duration(&self, retries: u32, rng: &mut impl Rng) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());
        let jitter_factor = rng.random_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter_factor)
    }
}

/// Chooses the proposal number for an attempt on `slot`.
///
/// `highest_seen` is the proposal number currently stored in the local
/// replica's copy of the slot, if any.
pub trait ProposalNumbers: Send + Sync + 'static {
    fn next_proposal_number(&self, slot: &Slot, highest_seen: Option<u64>) -> u64;
}

/// One above whatever the local replica has seen, starting at 1.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestSeenPlusOne;

impl ProposalNumbers for HighestSeenPlusOne {
    fn next_proposal_number(&self, _slot: &Slot, highest_seen: Option<u64>) -> u64 {
        highest_seen.map_or(1, |n| n.saturating_add(1))
    }
}

/// Always proposes the same number.
#[derive(Debug, Clone, Copy)]
pub struct Fixed(pub u64);

impl ProposalNumbers for Fixed {
    fn next_proposal_number(&self, _slot: &Slot, _highest_seen: Option<u64>) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub prepare: StageConfig<Stage>,
    pub accept: StageConfig<Stage>,
    pub respond: StageConfig<Stage>,
    /// How long a phase waits for its quorum decision before giving up.
    /// `None` waits until every replica has answered or failed.
    pub phase_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            prepare: StageConfig::new(Stage::Prepare, "prepare", 5, 10),
            accept: StageConfig::new(Stage::Accept, "accept", 5, 64),
            respond: StageConfig::new(Stage::Respond, "respond", 5, 64),
            phase_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn with_phase_timeout(mut self, phase_timeout: Option<Duration>) -> Self {
        self.phase_timeout = phase_timeout;
        self
    }

    pub(crate) fn stages(&self) -> [StageConfig<Stage>; 3] {
        [
            self.prepare.clone(),
            self.accept.clone(),
            self.respond.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn backoff_is_capped_and_jittered() {
        let config = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        let mut rng = StdRng::seed_from_u64(7);
        for retries in 0..20 {
            let d = config.duration(retries, &mut rng);
            assert!(d <= Duration::from_millis(1500), "{d:?}");
            assert!(d >= Duration::from_millis(50), "{d:?}");
        }
    }

    #[test]
    fn proposal_numbers() {
        let slot = Slot::new("eg", 0);
        assert_eq!(HighestSeenPlusOne.next_proposal_number(&slot, None), 1);
        assert_eq!(HighestSeenPlusOne.next_proposal_number(&slot, Some(4)), 5);
        assert_eq!(Fixed(1).next_proposal_number(&slot, Some(4)), 1);
    }

    #[test]
    fn default_stage_limits() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.prepare.max_concurrent, 5);
        assert_eq!(config.prepare.backlog, 10);
        assert_eq!(config.phase_timeout, Some(Duration::from_secs(30)));
    }
}
