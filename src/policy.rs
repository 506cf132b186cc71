//! Delay policy: which message types are throttled, by how much, and how
//! many attempts they get before a key is marked permanently failed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Retry ceiling applied when the policy source names no explicit one.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Throttling rule for one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRule {
    /// Minimum interval between successive attempts.
    pub delay_millis: i64,
    /// Maximum permitted attempts before the key is marked FAILED.
    pub max_retries: u32,
}

/// Immutable snapshot of the per-type delay table.
///
/// Types absent from the table are undelayed: no throttling, no retry
/// ceiling.
#[derive(Debug, Clone, Default)]
pub struct DelayPolicy {
    entries: HashMap<String, DelayRule>,
}

impl DelayPolicy {
    /// Policy with no throttled types.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the compact configuration form `type1,type2:millis;type3:millis`.
    ///
    /// A comma-group on the left shares one delay value. Surrounding `{}` and
    /// `'` noise is tolerated. Malformed groups (missing value, unparsable
    /// number) are logged and skipped; one bad entry never aborts the rest.
    pub fn parse(input: &str, max_retries: u32) -> Self {
        let mut entries = HashMap::new();
        let cleaned: String = input
            .chars()
            .filter(|c| !matches!(c, '{' | '}' | '\''))
            .collect();

        for group in cleaned.split(';') {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }

            let Some((types, value)) = group.split_once(':') else {
                tracing::warn!(group, "delay policy group has no value, skipping");
                continue;
            };

            let delay_millis = match value.trim().parse::<i64>() {
                Ok(v) if v >= 0 => v,
                _ => {
                    tracing::warn!(group, value, "unparsable delay value, skipping group");
                    continue;
                }
            };

            for message_type in types.split(',') {
                let message_type = message_type.trim();
                if message_type.is_empty() {
                    continue;
                }
                entries.insert(
                    message_type.to_string(),
                    DelayRule {
                        delay_millis,
                        max_retries,
                    },
                );
            }
        }

        Self { entries }
    }

    /// Rule for a message type, or `None` for undelayed types.
    pub fn rule(&self, message_type: &str) -> Option<DelayRule> {
        self.entries.get(message_type).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Hot-swappable holder for the current policy snapshot.
///
/// Readers take one `Arc` per decision and never observe a mix of old and
/// new entries; `replace` swaps the whole table at once.
pub struct PolicyHandle {
    current: RwLock<Arc<DelayPolicy>>,
}

impl PolicyHandle {
    pub fn new(policy: DelayPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    /// Consistent view of the table as of this call.
    pub async fn snapshot(&self) -> Arc<DelayPolicy> {
        self.current.read().await.clone()
    }

    /// Replace the whole table. In-flight readers keep their old snapshot.
    pub async fn replace(&self, policy: DelayPolicy) {
        *self.current.write().await = Arc::new(policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_group_shares_one_value() {
        let policy = DelayPolicy::parse("PROMO,NEWSLETTER:3000;OTP:60000", 5);
        assert_eq!(policy.len(), 3);
        assert_eq!(
            policy.rule("PROMO"),
            Some(DelayRule {
                delay_millis: 3000,
                max_retries: 5
            })
        );
        assert_eq!(policy.rule("NEWSLETTER").map(|r| r.delay_millis), Some(3000));
        assert_eq!(policy.rule("OTP").map(|r| r.delay_millis), Some(60000));
        assert_eq!(policy.rule("RECEIPT"), None);
    }

    #[test]
    fn malformed_groups_are_skipped_not_fatal() {
        let policy = DelayPolicy::parse("PROMO:3000;BROKEN;ALSO_BROKEN:abc;OTP:100", 5);
        assert_eq!(policy.len(), 2);
        assert!(policy.rule("BROKEN").is_none());
        assert!(policy.rule("ALSO_BROKEN").is_none());
        assert!(policy.rule("OTP").is_some());
    }

    #[test]
    fn tolerates_config_server_noise() {
        let policy = DelayPolicy::parse("{'PROMO':3000}", 5);
        assert_eq!(policy.rule("PROMO").map(|r| r.delay_millis), Some(3000));
    }

    #[test]
    fn negative_delay_is_malformed() {
        let policy = DelayPolicy::parse("PROMO:-5", 5);
        assert!(policy.is_empty());
    }

    #[test]
    fn empty_input_yields_empty_policy() {
        assert!(DelayPolicy::parse("", 5).is_empty());
        assert!(DelayPolicy::parse(";;", 5).is_empty());
    }

    #[test]
    fn retry_ceiling_comes_from_configured_default() {
        let policy = DelayPolicy::parse("PROMO:3000", 2);
        assert_eq!(policy.rule("PROMO").map(|r| r.max_retries), Some(2));
    }

    #[tokio::test]
    async fn replace_swaps_whole_table() {
        let handle = PolicyHandle::new(DelayPolicy::parse("PROMO:3000", 5));
        let before = handle.snapshot().await;

        handle.replace(DelayPolicy::parse("OTP:100", 5)).await;

        let after = handle.snapshot().await;
        assert!(after.rule("PROMO").is_none());
        assert!(after.rule("OTP").is_some());
        // The old snapshot stays internally consistent.
        assert!(before.rule("PROMO").is_some());
        assert!(before.rule("OTP").is_none());
    }
}
