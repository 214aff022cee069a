//! Restart policy for supervised processes.

use std::time::Duration;

use relay_ipc::ProcessRole;

/// How long a process must stay up before its restart delay resets.
pub const STABLE_AFTER_SECS: u64 = 10;

/// What a supervisor does when its process exits on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Stay exited and report the exit code to completion waiters.
    Never,

    /// Start a replacement after the backoff delay, without limit.
    Always(Backoff),
}

impl RestartPolicy {
    /// Default policy for a transcoder role.
    pub fn for_role(role: ProcessRole, backoff: Backoff) -> Self {
        match role {
            ProcessRole::Live => Self::Always(backoff),
            ProcessRole::Archival => Self::Never,
        }
    }

    /// Check if an unexpected exit leads to a restart.
    pub fn restarts(&self) -> bool {
        matches!(self, Self::Always(_))
    }
}

/// Delay between consecutive restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first restart (zero restarts immediately).
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Uptime after which the attempt counter resets.
    pub stable_after: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::immediate()
    }
}

impl Backoff {
    /// Restart immediately, every time.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            stable_after: Duration::from_secs(STABLE_AFTER_SECS),
        }
    }

    /// Doubling delay starting at `base_delay`, capped at `max_delay`.
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            stable_after: Duration::from_secs(STABLE_AFTER_SECS),
        }
    }

    /// Calculate delay for a given attempt number (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_backoff_never_waits() {
        let backoff = Backoff::immediate();

        assert_eq!(backoff.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(50), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let backoff = Backoff::exponential(Duration::from_millis(1000), Duration::from_secs(10));

        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for_attempt(8), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_policy_for_role() {
        assert!(RestartPolicy::for_role(ProcessRole::Live, Backoff::default()).restarts());
        assert!(!RestartPolicy::for_role(ProcessRole::Archival, Backoff::default()).restarts());
    }
}
