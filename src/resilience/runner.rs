//! Retry loop composing backoff, circuit breakers and classification.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::circuit_breaker::CircuitBreakers;
use super::classifier::{ErrorClassifier, ProcessingError};
use super::retry::RetryPolicies;
use super::{ErrorCategory, OperationContext, OperationError, Severity};

/// Terminal outcome of a failed [`ResilientRunner::run_with_retry`] call.
#[derive(Debug, Clone, Error)]
pub enum RunError {
    /// The last attempt failed, or the failure was not retryable
    #[error("failed after {attempts} attempt(s): {error}")]
    Exhausted { error: ProcessingError, attempts: u32 },

    /// The breaker rejected the call; the operation was not invoked
    #[error("circuit breaker open for {category}")]
    CircuitOpen { category: ErrorCategory },

    /// The operation reported cancellation
    #[error("operation cancelled")]
    Cancelled,
}

impl RunError {
    /// Category of the failure, when one applies.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            RunError::Exhausted { error, .. } => Some(error.category),
            RunError::CircuitOpen { category } => Some(*category),
            RunError::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }
}

/// Executes fallible async operations with retries.
///
/// The runner shares its breakers and classifier behind `Arc`s so several
/// pipelines (or concurrent tasks of one pipeline) feed the same health view.
#[derive(Debug, Clone)]
pub struct ResilientRunner {
    policies: RetryPolicies,
    breakers: Arc<CircuitBreakers>,
    classifier: Arc<ErrorClassifier>,
}

impl ResilientRunner {
    pub fn new(
        policies: RetryPolicies,
        breakers: Arc<CircuitBreakers>,
        classifier: Arc<ErrorClassifier>,
    ) -> Self {
        Self {
            policies,
            breakers,
            classifier,
        }
    }

    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Run `operation` until it succeeds, its failure is terminal, or the
    /// retry policy for `category` is exhausted.
    ///
    /// # Arguments
    /// * `category` - Category whose breaker and retry policy guard the call
    /// * `context` - Operation description copied into recorded errors
    /// * `operation` - Factory producing one attempt per invocation
    ///
    /// # Returns
    /// The operation's value on the first successful attempt
    ///
    /// # Errors
    /// - `RunError::CircuitOpen` if the breaker rejects an attempt
    /// - `RunError::Cancelled` if the operation reports cancellation
    /// - `RunError::Exhausted` if the final (or a non-retryable) attempt fails
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        category: ErrorCategory,
        context: &OperationContext,
        mut operation: F,
    ) -> Result<T, RunError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let policy = self.policies.for_category(category);
        let max_attempts = policy.max_attempts.max(1);
        let breaker = self.breakers.get(category);
        let mut attempt: u32 = 0;

        loop {
            if !breaker.can_execute() {
                warn!(
                    category = %category,
                    operation = %context.operation,
                    "Circuit breaker open, skipping operation"
                );
                self.classifier.record(ProcessingError {
                    category,
                    severity: Severity::Warning,
                    message: format!("circuit breaker open for {}", category),
                    context: context.to_fields(),
                    pattern_tag: None,
                    timestamp: Utc::now(),
                });
                return Err(RunError::CircuitOpen { category });
            }

            match operation().await {
                Ok(value) => {
                    breaker.record_success();
                    self.classifier.record_success();
                    if attempt > 0 {
                        info!(
                            operation = %context.operation,
                            attempts = attempt + 1,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(OperationError::Cancelled) => {
                    info!(operation = %context.operation, "Operation cancelled");
                    return Err(RunError::Cancelled);
                }
                Err(err) => {
                    let recorded = self.classifier.record_error(&err, context);
                    breaker.record_failure();
                    let attempts = attempt + 1;

                    if !recorded.category.is_retryable() || attempts >= max_attempts {
                        warn!(
                            operation = %context.operation,
                            category = %recorded.category,
                            attempts,
                            "Operation failed: {}",
                            recorded.message
                        );
                        return Err(RunError::Exhausted {
                            error: recorded,
                            attempts,
                        });
                    }

                    let delay = policy.delay(attempt);
                    debug!(
                        operation = %context.operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after failure: {}",
                        recorded.message
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::resilience::retry::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runner(max_attempts: u32, failure_threshold: u32) -> ResilientRunner {
        ResilientRunner::new(
            RetryPolicies::uniform(RetryPolicy::immediate(max_attempts)),
            Arc::new(CircuitBreakers::new(CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout_ms: 60_000,
            })),
            Arc::new(ErrorClassifier::default()),
        )
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let runner = runner(3, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = OperationContext::new("fetch_listing");

        let result = runner
            .run_with_retry(ErrorCategory::Network, &ctx, || {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(OperationError::failed("connection reset"))
                    } else {
                        Ok("payload")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "payload");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stats = runner.classifier().stats();
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(runner.breakers().get(ErrorCategory::Network).state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let runner = runner(3, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = OperationContext::new("fetch_listing");

        let result: Result<(), RunError> = runner
            .run_with_retry(ErrorCategory::Network, &ctx, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(OperationError::failed("timed out"))
                }
            })
            .await;

        match result {
            Err(RunError::Exhausted { error, attempts }) => {
                assert_eq!(attempts, 3);
                assert_eq!(error.category, ErrorCategory::Network);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_retried() {
        let runner = runner(5, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = OperationContext::new("download_pdf");

        let result: Result<(), RunError> = runner
            .run_with_retry(ErrorCategory::Network, &ctx, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(OperationError::Cancelled)
                }
            })
            .await;

        assert!(matches!(result, Err(RunError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.breakers().get(ErrorCategory::Network).consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_pdf_processing_is_not_retried() {
        let runner = runner(5, 10);
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = OperationContext::new("extract_text");

        let result: Result<(), RunError> = runner
            .run_with_retry(ErrorCategory::PdfProcessing, &ctx, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(OperationError::categorized(ErrorCategory::PdfProcessing, "bad xref"))
                }
            })
            .await;

        assert!(matches!(result, Err(RunError::Exhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_operation() {
        let runner = runner(1, 2);
        let ctx = OperationContext::new("query_arxiv");

        for _ in 0..2 {
            let _: Result<(), RunError> = runner
                .run_with_retry(ErrorCategory::ArxivApi, &ctx, || async {
                    Err(OperationError::failed("arxiv 503"))
                })
                .await;
        }

        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), RunError> = runner
            .run_with_retry(ErrorCategory::ArxivApi, &ctx, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(RunError::CircuitOpen {
                category: ErrorCategory::ArxivApi
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Other categories are unaffected
        let ok = runner
            .run_with_retry(ErrorCategory::Storage, &ctx, || async { Ok(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_breaker_opens_mid_retry_loop() {
        let runner = runner(5, 2);
        let calls = Arc::new(AtomicU32::new(0));
        let ctx = OperationContext::new("fetch_listing");

        let result: Result<(), RunError> = runner
            .run_with_retry(ErrorCategory::Network, &ctx, || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(OperationError::failed("connection refused"))
                }
            })
            .await;

        assert!(matches!(result, Err(RunError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
