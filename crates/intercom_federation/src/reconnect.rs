//! Reconnect scheduling for outbound links.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::FederationConfig;
use crate::connection::TimerEvent;
use crate::identity::ServerId;
use crate::timer::TimerHandle;

/// Fixed-delay retry policy with a cap on consecutive attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &FederationConfig) -> Self {
        Self {
            interval: config.reconnect_interval,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Account for a failed link. Returns the delay before the next attempt,
    /// or `None` once `attempts` has reached the cap. The counter is only
    /// reset by a successful handshake or an explicit `add_peer`.
    pub fn next_attempt(&self, attempts: &mut u32) -> Option<Duration> {
        if *attempts >= self.max_attempts {
            return None;
        }
        *attempts += 1;
        Some(self.interval)
    }
}

/// Arm a one-shot timer that reports [`TimerEvent::ReconnectDue`] for
/// `server_id` after `delay`.
pub fn schedule(
    server_id: ServerId,
    delay: Duration,
    timers: mpsc::UnboundedSender<TimerEvent>,
) -> TimerHandle {
    TimerHandle::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = timers.send(TimerEvent::ReconnectDue(server_id));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            interval: Duration::from_millis(100),
            max_attempts,
        }
    }

    #[test]
    fn test_attempts_are_capped() {
        let policy = policy(2);
        let mut attempts = 0;
        assert_eq!(policy.next_attempt(&mut attempts), Some(Duration::from_millis(100)));
        assert_eq!(policy.next_attempt(&mut attempts), Some(Duration::from_millis(100)));
        assert_eq!(attempts, 2);
        assert_eq!(policy.next_attempt(&mut attempts), None);
        assert_eq!(attempts, 2);
    }

    #[test]
    fn test_zero_cap_never_retries() {
        let mut attempts = 0;
        assert_eq!(policy(0).next_attempt(&mut attempts), None);
        assert_eq!(attempts, 0);
    }

    #[test]
    fn test_policy_from_config() {
        let config = FederationConfig::default();
        let policy = ReconnectPolicy::from_config(&config);
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.max_attempts, 5);
    }

    #[tokio::test]
    async fn test_schedule_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _timer = schedule(ServerId::from("srv-2"), Duration::from_millis(10), tx);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, TimerEvent::ReconnectDue(ServerId::from("srv-2")));
    }

    #[tokio::test]
    async fn test_cancelled_schedule_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timer = schedule(ServerId::from("srv-2"), Duration::from_millis(10), tx);
        drop(timer);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
    }
}
