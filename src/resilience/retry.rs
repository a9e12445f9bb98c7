//! Exponential backoff policy.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ErrorCategory;

/// Backoff policy for one error category.
///
/// `delay(attempt) = min(base_delay * exponential_base^attempt, max_delay)`.
/// The calculation is pure: no clock, no randomness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            exponential_base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
        exponential_base: f64,
    ) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
            exponential_base,
        }
    }

    /// A policy with no waiting between attempts. Handy for tests and local sources.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0, 0, 1.0)
    }

    /// Delay to wait after the failed attempt `attempt` (0-based).
    ///
    /// Non-decreasing in `attempt` for any valid policy and never above
    /// `max_delay_ms`. Overflowing intermediate values saturate to the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let cap = self.max_delay_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.exponential_base.powi(exponent);

        let millis = if raw.is_finite() { raw.min(cap) } else { cap };
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Check the policy for values that would break the backoff contract.
    ///
    /// # Errors
    /// Returns a description of the first invalid field
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(format!(
                "exponential_base must be a finite number >= 1.0, got {}",
                self.exponential_base
            ));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) must not be smaller than base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }
        Ok(())
    }
}

/// Retry policies keyed by error category, with a fallback default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicies {
    pub default: RetryPolicy,
    pub overrides: BTreeMap<ErrorCategory, RetryPolicy>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let mut overrides = BTreeMap::new();
        // arXiv asks clients to back off generously
        overrides.insert(ErrorCategory::ArxivApi, RetryPolicy::new(5, 3_000, 120_000, 2.0));
        overrides.insert(ErrorCategory::JournalSource, RetryPolicy::new(3, 2_000, 60_000, 2.0));
        overrides.insert(ErrorCategory::PdfProcessing, RetryPolicy::new(1, 0, 0, 1.0));
        overrides.insert(ErrorCategory::VectorStore, RetryPolicy::new(3, 500, 10_000, 2.0));

        Self {
            default: RetryPolicy::default(),
            overrides,
        }
    }
}

impl RetryPolicies {
    /// One policy for every category.
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            default: policy,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        self.overrides.insert(category, policy);
        self
    }

    pub fn for_category(&self, category: ErrorCategory) -> &RetryPolicy {
        self.overrides.get(&category).unwrap_or(&self.default)
    }

    /// Validate the default and every override.
    ///
    /// # Errors
    /// Returns the first invalid policy, prefixed with its category
    pub fn validate(&self) -> Result<(), String> {
        self.default
            .validate()
            .map_err(|e| format!("default retry policy: {}", e))?;
        for (category, policy) in &self.overrides {
            policy
                .validate()
                .map_err(|e| format!("{} retry policy: {}", category, e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy::new(5, 100, 10_000, 2.0);
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, 1_000, 5_000, 3.0);
        assert_eq!(policy.delay(1), Duration::from_millis(3_000));
        assert_eq!(policy.delay(2), Duration::from_millis(5_000));
        assert_eq!(policy.delay(9), Duration::from_millis(5_000));
    }

    #[test]
    fn test_delay_non_decreasing_and_bounded() {
        let policies = [
            RetryPolicy::default(),
            RetryPolicy::new(8, 250, 30_000, 1.5),
            RetryPolicy::new(4, 0, 0, 1.0),
            RetryPolicy::new(20, 1, 1_000, 10.0),
        ];

        for policy in &policies {
            let mut previous = Duration::ZERO;
            for attempt in 0..64 {
                let delay = policy.delay(attempt);
                assert!(delay >= previous, "delay decreased at attempt {}", attempt);
                assert!(delay <= Duration::from_millis(policy.max_delay_ms));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_huge_attempt_saturates() {
        let policy = RetryPolicy::new(3, 1_000, 60_000, 2.0);
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new(0, 1, 2, 2.0).validate().is_err());
        assert!(RetryPolicy::new(3, 1, 2, 0.5).validate().is_err());
        assert!(RetryPolicy::new(3, 1, 2, f64::NAN).validate().is_err());
        assert!(RetryPolicy::new(3, 10, 2, 2.0).validate().is_err());
    }

    #[test]
    fn test_policies_fall_back_to_default() {
        let policies = RetryPolicies::default();
        assert_eq!(policies.for_category(ErrorCategory::ArxivApi).max_attempts, 5);
        assert_eq!(policies.for_category(ErrorCategory::Network), &policies.default);
        assert!(policies.validate().is_ok());
    }

    #[test]
    fn test_policies_deserialize_from_toml() {
        let raw = r#"
            [default]
            max_attempts = 4
            base_delay_ms = 10

            [overrides.network]
            max_attempts = 7
            base_delay_ms = 5
            max_delay_ms = 50
            exponential_base = 2.0
        "#;
        let policies: RetryPolicies = toml::from_str(raw).unwrap();
        assert_eq!(policies.default.max_attempts, 4);
        assert_eq!(policies.default.max_delay_ms, 60_000);
        assert_eq!(policies.for_category(ErrorCategory::Network).max_attempts, 7);
    }
}
