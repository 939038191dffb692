//! Consecutive-failure tracking for the fetch session.

use std::time::Duration;

use gsync_adapters::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    CooldownRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSignal {
    Success,
    Failure,
    Blocked,
}

impl From<&FetchError> for FetchSignal {
    fn from(err: &FetchError) -> Self {
        if err.is_block() {
            Self::Blocked
        } else {
            Self::Failure
        }
    }
}

/// What the orchestrator must do after a fetch outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Directive {
    /// Mandatory pause before the next fetch.
    pub cooldown: Option<Duration>,
    /// Recreate the fetch session, then call [`FailureCoordinator::acknowledge_restart`].
    pub restart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureState {
    consecutive: u32,
    threshold: u32,
}

impl FailureState {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn health(&self) -> HealthState {
        match self.consecutive {
            0 => HealthState::Healthy,
            n if n < self.threshold => HealthState::Degraded,
            _ => HealthState::CooldownRequired,
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    fn record_failure(&mut self) {
        self.consecutive = self.consecutive.saturating_add(1);
    }
}

/// Process-wide: failures accumulate across subjects.
#[derive(Debug, Clone)]
pub struct FailureCoordinator {
    state: FailureState,
    block_cooldown: Duration,
}

impl FailureCoordinator {
    pub fn new(threshold: u32, block_cooldown: Duration) -> Self {
        Self {
            state: FailureState::new(threshold),
            block_cooldown,
        }
    }

    pub fn state(&self) -> FailureState {
        self.state
    }

    pub fn observe(&mut self, signal: FetchSignal) -> Directive {
        match signal {
            FetchSignal::Success => {
                self.state.reset();
                return Directive::default();
            }
            FetchSignal::Failure | FetchSignal::Blocked => self.state.record_failure(),
        }

        Directive {
            cooldown: (signal == FetchSignal::Blocked).then_some(self.block_cooldown),
            restart: self.state.health() == HealthState::CooldownRequired,
        }
    }

    pub fn acknowledge_restart(&mut self) {
        self.state.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> FailureCoordinator {
        FailureCoordinator::new(5, Duration::from_secs(300))
    }

    #[test]
    fn fifth_consecutive_failure_requests_one_restart() {
        let mut coordinator = coordinator();
        let mut restarts = 0;
        for _ in 0..5 {
            let directive = coordinator.observe(FetchSignal::Failure);
            assert_eq!(directive.cooldown, None);
            if directive.restart {
                restarts += 1;
                coordinator.acknowledge_restart();
            }
        }
        assert_eq!(restarts, 1);
        assert_eq!(coordinator.state().health(), HealthState::Healthy);
    }

    #[test]
    fn success_resets_the_counter() {
        let mut coordinator = coordinator();
        for _ in 0..3 {
            assert!(!coordinator.observe(FetchSignal::Failure).restart);
        }
        assert_eq!(coordinator.state().health(), HealthState::Degraded);
        assert_eq!(coordinator.observe(FetchSignal::Success), Directive::default());
        assert_eq!(coordinator.state().consecutive(), 0);
        assert!(!coordinator.observe(FetchSignal::Failure).restart);
        assert_eq!(coordinator.state().consecutive(), 1);
    }

    #[test]
    fn block_counts_and_demands_cooldown() {
        let mut coordinator = coordinator();
        let directive = coordinator.observe(FetchSignal::Blocked);
        assert_eq!(directive.cooldown, Some(Duration::from_secs(300)));
        assert!(!directive.restart);
        assert_eq!(coordinator.state().consecutive(), 1);
    }

    #[test]
    fn block_on_threshold_both_cools_down_and_restarts() {
        let mut coordinator = coordinator();
        for _ in 0..4 {
            coordinator.observe(FetchSignal::Failure);
        }
        let directive = coordinator.observe(FetchSignal::Blocked);
        assert!(directive.cooldown.is_some());
        assert!(directive.restart);
    }

    #[test]
    fn signal_follows_error_kind() {
        let blocked = FetchError::Blocked {
            url: "u".into(),
            reason: "r".into(),
        };
        let transient = FetchError::Transient {
            url: "u".into(),
            message: "timeout".into(),
        };
        assert_eq!(FetchSignal::from(&blocked), FetchSignal::Blocked);
        assert_eq!(FetchSignal::from(&transient), FetchSignal::Failure);
    }
}
