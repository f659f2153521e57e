//! Per-message delivery policy.

use std::time::Duration;

/// Optional delivery capabilities declared by a message.
///
/// Every field left at `None` keeps the queue default:
/// no delay, no expiry, priority 0 and no deduplication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePolicy {
    /// Delay before the message becomes claimable
    pub delay: Option<Duration>,
    /// Time after which the message is discarded instead of delivered
    pub ttl: Option<Duration>,
    /// Higher values are claimed first
    pub priority: Option<i32>,
    /// At most one unleased message per key is kept in the queue
    pub uniqueness_key: Option<String>,
}

impl MessagePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay in milliseconds.
    pub fn delay_ms(mut self, millis: u64) -> Self {
        self.delay = Some(Duration::from_millis(millis));
        self
    }

    /// Time-to-live in seconds.
    pub fn ttl_secs(mut self, secs: u64) -> Self {
        self.ttl = Some(Duration::from_secs(secs));
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn unique(mut self, key: impl Into<String>) -> Self {
        self.uniqueness_key = Some(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_empty() {
        assert!(MessagePolicy::default().is_empty());
    }

    #[test]
    fn test_builder() {
        let policy = MessagePolicy::new()
            .delay_ms(1500)
            .ttl_secs(60)
            .priority(7)
            .unique("order-42");

        assert_eq!(policy.delay, Some(Duration::from_millis(1500)));
        assert_eq!(policy.ttl, Some(Duration::from_secs(60)));
        assert_eq!(policy.priority, Some(7));
        assert_eq!(policy.uniqueness_key.as_deref(), Some("order-42"));
        assert!(!policy.is_empty());
    }
}
