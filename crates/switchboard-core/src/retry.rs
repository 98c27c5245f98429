//! Handler retry policy.
//!
//! Stateless: all logic lives in associated functions that take the
//! [`RetryConfig`] as a parameter. Attempts are 1-based (the first
//! invocation is attempt 1).

use std::time::Duration;

use switchboard_types::config::{BackoffStrategy, RetryConfig};
use switchboard_types::event::Event;

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt may follow attempt number `attempt`.
    ///
    /// Both the policy's `max_attempts` and the event's own retry budget
    /// must allow it.
    pub fn should_retry(config: &RetryConfig, attempt: u32, event: &Event) -> bool {
        attempt < config.max_attempts && event.can_retry()
    }

    /// Delay to wait after attempt number `attempt` failed.
    pub fn delay_for(config: &RetryConfig, attempt: u32) -> Duration {
        let base = config.base_delay_ms as f64;
        let millis = match config.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                base * config.multiplier.powi(exponent)
            }
        };
        let capped = millis.min(config.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn event(max_retries: u32) -> Event {
        Event::command("c", Map::new()).with_max_retries(max_retries)
    }

    #[test]
    fn default_policy_allows_exactly_one_retry() {
        let config = RetryConfig::default();
        let event = event(3);
        assert!(RetryHandler::should_retry(&config, 1, &event));
        assert!(!RetryHandler::should_retry(&config, 2, &event));
    }

    #[test]
    fn event_budget_caps_attempts() {
        let config = RetryConfig::immediate(5);
        let mut event = event(1);
        assert!(RetryHandler::should_retry(&config, 1, &event));
        event.increment_retry();
        assert!(!RetryHandler::should_retry(&config, 2, &event));
    }

    #[test]
    fn zero_budget_never_retries() {
        assert!(!RetryHandler::should_retry(&RetryConfig::default(), 1, &event(0)));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let config = RetryConfig::default();
        assert_eq!(RetryHandler::delay_for(&config, 1), Duration::from_millis(1_000));
        assert_eq!(RetryHandler::delay_for(&config, 4), Duration::from_millis(1_000));
    }

    #[test]
    fn exponential_delay_grows_and_caps() {
        let config = RetryConfig {
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        };
        assert_eq!(RetryHandler::delay_for(&config, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::delay_for(&config, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::delay_for(&config, 3), Duration::from_millis(400));
        assert_eq!(RetryHandler::delay_for(&config, 10), Duration::from_millis(1_000));
    }
}
