//! Error classification, pattern detection and processing health.
//!
//! The classifier turns raw failure messages into [`ProcessingError`]s with a
//! category and severity, keeps running counters, and derives a health status
//! and recommendations from them. Keyword rules are data, not code: callers
//! can register their own [`ClassificationRule`]s ahead of the defaults.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::{ErrorCategory, OperationContext, OperationError, Severity};

/// Schema version of the exported error report.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// What a [`ClassificationRule`] matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleTarget {
    /// The lower-cased error message
    Message,
    /// The operation name from the [`OperationContext`]
    Operation,
}

/// Keyword rule mapping matching text to a category and severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub target: RuleTarget,
    pub keywords: Vec<String>,
    pub category: ErrorCategory,
    pub severity: Severity,
}

impl ClassificationRule {
    pub fn message(category: ErrorCategory, severity: Severity, keywords: &[&str]) -> Self {
        Self {
            target: RuleTarget::Message,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            category,
            severity,
        }
    }

    pub fn operation(category: ErrorCategory, keywords: &[&str]) -> Self {
        Self {
            target: RuleTarget::Operation,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            category,
            severity: Severity::Error,
        }
    }

    fn matches(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }
}

/// Built-in rules, most specific first.
pub fn default_rules() -> Vec<ClassificationRule> {
    use ErrorCategory::*;
    vec![
        ClassificationRule::message(
            Unknown,
            Severity::Critical,
            &["out of memory", "memory allocation", "cannot allocate"],
        ),
        ClassificationRule::message(
            Storage,
            Severity::Critical,
            &["no space left", "disk full", "disk space", "quota exceeded"],
        ),
        ClassificationRule::message(
            Storage,
            Severity::Critical,
            &["corrupt", "malformed", "checksum mismatch"],
        ),
        ClassificationRule::message(ArxivApi, Severity::Error, &["arxiv"]),
        ClassificationRule::message(
            JournalSource,
            Severity::Error,
            &["journal", "jstatsoft", "r-project"],
        ),
        ClassificationRule::message(
            PdfProcessing,
            Severity::Error,
            &["pdf", "extract", "xref", "encrypted document"],
        ),
        ClassificationRule::message(
            VectorStore,
            Severity::Error,
            &["embedding", "vector", "collection", "dimension"],
        ),
        ClassificationRule::message(
            Storage,
            Severity::Error,
            &["sqlite", "database", "metadata", "permission denied"],
        ),
        ClassificationRule::message(
            Network,
            Severity::Error,
            &["unauthorized", "forbidden", "authentication", "api key"],
        ),
        ClassificationRule::message(
            Network,
            Severity::Warning,
            &[
                "timeout",
                "timed out",
                "connection",
                "connect",
                "dns",
                "network",
                "unreachable",
                "reset by peer",
                "rate limit",
                "too many requests",
                "429",
                "502",
                "503",
            ],
        ),
        ClassificationRule::operation(ArxivApi, &["arxiv"]),
        ClassificationRule::operation(JournalSource, &["journal"]),
        ClassificationRule::operation(PdfProcessing, &["pdf", "extract"]),
        ClassificationRule::operation(
            VectorStore,
            &["embed", "chunk", "vector", "search", "store_chunks"],
        ),
        ClassificationRule::operation(Storage, &["metadata", "storage", "save"]),
        ClassificationRule::operation(Network, &["download", "fetch", "discover", "http"]),
    ]
}

/// Best-effort recurring-pattern tag for a failure message.
pub fn detect_pattern(message: &str, category: ErrorCategory) -> Option<&'static str> {
    let lowered = message.to_lowercase();
    let any = |keys: &[&str]| keys.iter().any(|k| lowered.contains(k));

    if any(&["timeout", "timed out", "deadline"]) {
        Some("timeout_pattern")
    } else if any(&["rate limit", "too many requests", "429"]) {
        Some("rate_limit_pattern")
    } else if any(&["unauthorized", "forbidden", "authentication", "api key", "401", "403"]) {
        Some("authentication_pattern")
    } else if any(&["not found", "404", "no such file"]) {
        Some("not_found_pattern")
    } else if any(&["out of memory", "memory allocation", "cannot allocate"]) {
        Some("memory_pattern")
    } else if any(&["no space left", "disk full", "disk space", "quota exceeded"]) {
        Some("disk_space_pattern")
    } else if any(&["corrupt", "malformed", "checksum"]) {
        Some("corruption_pattern")
    } else if any(&["connection", "connect", "dns", "unreachable", "reset by peer"]) {
        Some("connection_pattern")
    } else if category == ErrorCategory::PdfProcessing && any(&["invalid", "parse", "unexpected"]) {
        Some("corruption_pattern")
    } else {
        None
    }
}

/// A classified failure. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub message: String,
    pub context: BTreeMap<String, String>,
    pub pattern_tag: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}/{}] {}", self.category, self.severity, self.message)
    }
}

/// Overall processing health, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Thresholds and identity for one classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Instance the classifier reports for, if any
    pub instance_name: Option<String>,

    /// Identifier of the processor in reports
    pub processor_id: String,

    /// Consecutive failures after which processing should stop
    pub max_consecutive_failures: u32,

    /// Windowed error rate above which processing should stop
    pub max_error_rate: f64,

    /// Number of most recent outcomes in the error-rate window
    pub error_rate_window: usize,

    /// Outcomes required before the error rate is considered at all
    pub min_samples_for_rate: usize,

    /// Capacity of the recent-errors ring
    pub recent_errors_capacity: usize,

    /// Occurrences after which a pattern counts as recurring
    pub recurring_pattern_threshold: u64,

    /// Error rate at which health becomes `Degraded`
    pub degraded_error_rate: f64,

    /// Error rate at which health becomes `Warning`
    pub warning_error_rate: f64,

    /// Error rate at which health becomes `Critical`
    pub critical_error_rate: f64,

    /// Critical errors at which health becomes `Warning`
    pub warning_critical_errors: u64,

    /// Critical errors at which health becomes `Critical`
    pub critical_critical_errors: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            instance_name: None,
            processor_id: "scholar-downloader".to_string(),
            max_consecutive_failures: 10,
            max_error_rate: 0.5,
            error_rate_window: 50,
            min_samples_for_rate: 10,
            recent_errors_capacity: 100,
            recurring_pattern_threshold: 3,
            degraded_error_rate: 0.1,
            warning_error_rate: 0.25,
            critical_error_rate: 0.5,
            warning_critical_errors: 1,
            critical_critical_errors: 5,
        }
    }
}

impl ClassifierConfig {
    /// # Errors
    /// Returns a description of the first inconsistent threshold
    pub fn validate(&self) -> Result<(), String> {
        if self.max_consecutive_failures == 0 {
            return Err("max_consecutive_failures must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(format!(
                "max_error_rate must be within [0, 1], got {}",
                self.max_error_rate
            ));
        }
        if self.error_rate_window == 0 || self.min_samples_for_rate > self.error_rate_window {
            return Err(
                "min_samples_for_rate must not exceed a non-empty error_rate_window".to_string()
            );
        }
        if !(self.degraded_error_rate <= self.warning_error_rate
            && self.warning_error_rate <= self.critical_error_rate)
        {
            return Err("health error-rate thresholds must be non-decreasing".to_string());
        }
        if self.warning_critical_errors > self.critical_critical_errors {
            return Err(
                "warning_critical_errors must not exceed critical_critical_errors".to_string()
            );
        }
        Ok(())
    }
}

/// Snapshot of the classifier's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub critical_errors: u64,
    pub errors_by_category: BTreeMap<ErrorCategory, u64>,
    pub errors_by_severity: BTreeMap<Severity, u64>,
    pub pattern_counts: BTreeMap<String, u64>,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub error_rate: f64,
    pub window_samples: usize,
    pub recent_errors: Vec<ProcessingError>,
}

/// Summary section of an exported report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub stats: ErrorStats,
    pub health_status: HealthStatus,
    pub recommendations: Vec<String>,
}

/// Error report consumed by downstream tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub report_type: String,
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub instance_name: Option<String>,
    pub processor_id: String,
    pub summary: ReportSummary,
}

/// Errors raised while exporting a report.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
struct ClassifierState {
    total_errors: u64,
    critical_errors: u64,
    errors_by_category: BTreeMap<ErrorCategory, u64>,
    errors_by_severity: BTreeMap<Severity, u64>,
    pattern_counts: BTreeMap<String, u64>,
    consecutive_failures: u32,
    total_successes: u64,
    last_success_time: Option<DateTime<Utc>>,
    last_error_time: Option<DateTime<Utc>>,
    recent_errors: VecDeque<ProcessingError>,
    /// `true` for a failure, `false` for a success
    window: VecDeque<bool>,
}

/// Classifies failures and tracks processing health.
#[derive(Debug)]
pub struct ErrorClassifier {
    config: ClassifierConfig,
    rules: Vec<ClassificationRule>,
    state: Mutex<ClassifierState>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl ErrorClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            rules: default_rules(),
            state: Mutex::new(ClassifierState::default()),
        }
    }

    /// Register a rule that takes precedence over every existing rule.
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    /// Replace the rule set entirely.
    pub fn with_rules(mut self, rules: Vec<ClassificationRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify a failure without recording it.
    ///
    /// Precedence: explicit category hint, then message rules, then
    /// operation rules, then `Unknown`. With a hint, severity still comes
    /// from the first matching message rule so "disk full" stays critical.
    pub fn classify(
        &self,
        message: &str,
        operation: &str,
        category_hint: Option<ErrorCategory>,
    ) -> (ErrorCategory, Severity) {
        let lowered_message = message.to_lowercase();
        let message_match = self
            .rules
            .iter()
            .filter(|r| r.target == RuleTarget::Message)
            .find(|r| r.matches(&lowered_message));

        if let Some(category) = category_hint {
            let severity = message_match.map(|r| r.severity).unwrap_or(Severity::Error);
            return (category, severity);
        }

        if let Some(rule) = message_match {
            return (rule.category, rule.severity);
        }

        let lowered_operation = operation.to_lowercase();
        self.rules
            .iter()
            .filter(|r| r.target == RuleTarget::Operation)
            .find(|r| r.matches(&lowered_operation))
            .map(|r| (r.category, r.severity))
            .unwrap_or((ErrorCategory::Unknown, Severity::Error))
    }

    /// Classify an operation failure and record it.
    pub fn record_error(
        &self,
        error: &OperationError,
        context: &OperationContext,
    ) -> ProcessingError {
        let (message, hint) = match error {
            OperationError::Cancelled => ("operation cancelled".to_string(), None),
            OperationError::Failed { message, category_hint } => (message.clone(), *category_hint),
        };
        let (category, severity) = self.classify(&message, &context.operation, hint);
        let processing_error = ProcessingError {
            category,
            severity,
            pattern_tag: detect_pattern(&message, category).map(str::to_string),
            message,
            context: context.to_fields(),
            timestamp: Utc::now(),
        };
        self.record(processing_error.clone());
        processing_error
    }

    /// Record an already classified error.
    pub fn record(&self, error: ProcessingError) {
        debug!(
            category = %error.category,
            severity = %error.severity,
            pattern = ?error.pattern_tag,
            "Recording processing error: {}",
            error.message
        );

        let mut state = self.state.lock();
        state.total_errors += 1;
        if error.severity == Severity::Critical {
            state.critical_errors += 1;
        }
        *state.errors_by_category.entry(error.category).or_insert(0) += 1;
        *state.errors_by_severity.entry(error.severity).or_insert(0) += 1;
        if let Some(tag) = &error.pattern_tag {
            *state.pattern_counts.entry(tag.clone()).or_insert(0) += 1;
        }
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_error_time = Some(error.timestamp);

        state.recent_errors.push_back(error);
        while state.recent_errors.len() > self.config.recent_errors_capacity {
            state.recent_errors.pop_front();
        }
        push_outcome(&mut state.window, true, self.config.error_rate_window);
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.total_successes += 1;
        state.consecutive_failures = 0;
        state.last_success_time = Some(Utc::now());
        push_outcome(&mut state.window, false, self.config.error_rate_window);
    }

    /// Failure ratio over the sliding outcome window.
    pub fn error_rate(&self) -> f64 {
        let state = self.state.lock();
        window_rate(&state.window)
    }

    pub fn stats(&self) -> ErrorStats {
        let state = self.state.lock();
        ErrorStats {
            total_errors: state.total_errors,
            critical_errors: state.critical_errors,
            errors_by_category: state.errors_by_category.clone(),
            errors_by_severity: state.errors_by_severity.clone(),
            pattern_counts: state.pattern_counts.clone(),
            consecutive_failures: state.consecutive_failures,
            total_successes: state.total_successes,
            last_success_time: state.last_success_time,
            last_error_time: state.last_error_time,
            error_rate: window_rate(&state.window),
            window_samples: state.window.len(),
            recent_errors: state.recent_errors.iter().cloned().collect(),
        }
    }

    /// Health derived from the windowed error rate, critical errors and
    /// consecutive failures. Worse inputs never yield a better status.
    pub fn health_status(&self) -> HealthStatus {
        let stats = self.stats();
        self.health_from_stats(&stats)
    }

    fn health_from_stats(&self, stats: &ErrorStats) -> HealthStatus {
        let cfg = &self.config;

        let rate = if stats.window_samples >= cfg.min_samples_for_rate {
            stats.error_rate
        } else {
            0.0
        };
        let by_rate = if rate >= cfg.critical_error_rate && rate > 0.0 {
            HealthStatus::Critical
        } else if rate >= cfg.warning_error_rate && rate > 0.0 {
            HealthStatus::Warning
        } else if rate >= cfg.degraded_error_rate && rate > 0.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let critical = stats.critical_errors;
        let by_critical = if critical > 0 && critical >= cfg.critical_critical_errors {
            HealthStatus::Critical
        } else if critical > 0 && critical >= cfg.warning_critical_errors {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        let by_streak = if stats.consecutive_failures >= cfg.max_consecutive_failures {
            HealthStatus::Critical
        } else if stats.consecutive_failures > 0
            && stats.consecutive_failures * 2 >= cfg.max_consecutive_failures
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        by_rate.max(by_critical).max(by_streak)
    }

    /// Whether the pipeline should keep going.
    ///
    /// False once consecutive failures reach the configured maximum, or once
    /// the window holds enough outcomes and its error rate exceeds the maximum.
    pub fn should_continue_processing(&self) -> bool {
        let state = self.state.lock();
        if state.consecutive_failures >= self.config.max_consecutive_failures {
            return false;
        }
        if state.window.len() >= self.config.min_samples_for_rate
            && window_rate(&state.window) > self.config.max_error_rate
        {
            return false;
        }
        true
    }

    /// Human-readable recommendations derived from crossed thresholds.
    pub fn recommendations(&self) -> Vec<String> {
        let stats = self.stats();
        self.recommendations_from_stats(&stats)
    }

    fn recommendations_from_stats(&self, stats: &ErrorStats) -> Vec<String> {
        let cfg = &self.config;
        let mut out = Vec::new();

        if stats.consecutive_failures > 0
            && stats.consecutive_failures * 2 >= cfg.max_consecutive_failures
        {
            out.push(format!(
                "{} consecutive failures; check connectivity to upstream sources before continuing",
                stats.consecutive_failures
            ));
        }

        if stats.total_errors > 0 && stats.critical_errors > 0 {
            let ratio = stats.critical_errors as f64 / stats.total_errors as f64;
            if ratio > 0.1 {
                out.push(format!(
                    "Critical errors make up {:.0}% of failures; \
                     inspect system resources (memory, disk)",
                    ratio * 100.0
                ));
            }
        }

        if stats.total_errors >= 5 {
            let dominant = stats.errors_by_category.iter().max_by_key(|(_, c)| **c);
            if let Some((category, count)) = dominant {
                if *count as f64 / stats.total_errors as f64 > 0.5 {
                    out.push(category_advice(*category).to_string());
                }
            }
        }

        for (tag, count) in &stats.pattern_counts {
            if *count >= cfg.recurring_pattern_threshold {
                out.push(pattern_advice(tag, *count));
            }
        }

        out
    }

    /// Build the exportable report from the current counters.
    pub fn build_report(&self) -> ErrorReport {
        let stats = self.stats();
        let health_status = self.health_from_stats(&stats);
        let recommendations = self.recommendations_from_stats(&stats);
        ErrorReport {
            report_type: "error_report".to_string(),
            schema_version: REPORT_SCHEMA_VERSION,
            generated_at: Utc::now(),
            instance_name: self.config.instance_name.clone(),
            processor_id: self.config.processor_id.clone(),
            summary: ReportSummary {
                stats,
                health_status,
                recommendations,
            },
        }
    }

    /// Write the report as pretty JSON to `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns `ReportError` if the report cannot be serialized or written
    pub async fn export_report(&self, path: &Path) -> Result<ErrorReport, ReportError> {
        let report = self.build_report();
        let json = serde_json::to_string_pretty(&report)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path, json).await?;
        info!(path = %path.display(), "Exported error report");
        Ok(report)
    }

    /// Forget all recorded outcomes.
    pub fn reset(&self) {
        *self.state.lock() = ClassifierState::default();
    }
}

fn push_outcome(window: &mut VecDeque<bool>, failed: bool, capacity: usize) {
    window.push_back(failed);
    while window.len() > capacity {
        window.pop_front();
    }
}

fn window_rate(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    window.iter().filter(|f| **f).count() as f64 / window.len() as f64
}

fn category_advice(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Network => {
            "Most failures are network errors; check connectivity or lower max_concurrent_downloads"
        }
        ErrorCategory::ArxivApi => {
            "arXiv API errors dominate; raise the arxiv_api retry delay to respect rate limits"
        }
        ErrorCategory::JournalSource => {
            "Journal source errors dominate; the listing page layout may have changed"
        }
        ErrorCategory::PdfProcessing => {
            "PDF extraction failures dominate; inspect the source documents"
        }
        ErrorCategory::VectorStore => {
            "Vector store errors dominate; check the embedding model and collection health"
        }
        ErrorCategory::Storage => {
            "Storage errors dominate; check disk space and permissions on the data directories"
        }
        ErrorCategory::Unknown => "Unclassified errors dominate; add classification rules for them",
    }
}

fn pattern_advice(tag: &str, count: u64) -> String {
    let advice = match tag {
        "timeout_pattern" => "raise request timeouts or reduce concurrency",
        "rate_limit_pattern" => "slow down requests to the upstream source",
        "connection_pattern" => "verify network access to the upstream source",
        "authentication_pattern" => "check configured credentials and API keys",
        "not_found_pattern" => "the discovery listing may reference removed documents",
        "memory_pattern" => "reduce batch sizes or concurrent downloads",
        "disk_space_pattern" => "free disk space on the storage volume",
        "corruption_pattern" => "re-download affected documents and verify storage integrity",
        _ => "investigate the recurring failure",
    };
    format!("Recurring {} ({} occurrences): {}", tag, count, advice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn failed(message: &str) -> OperationError {
        OperationError::failed(message)
    }

    fn small_window_config() -> ClassifierConfig {
        ClassifierConfig {
            max_consecutive_failures: 4,
            max_error_rate: 0.5,
            error_rate_window: 10,
            min_samples_for_rate: 4,
            ..ClassifierConfig::default()
        }
    }

    #[test]
    fn test_classify_by_message() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify("arXiv returned 503", "discover", None),
            (ErrorCategory::ArxivApi, Severity::Error)
        );
        assert_eq!(
            classifier.classify("connection refused", "anything", None).0,
            ErrorCategory::Network
        );
        assert_eq!(
            classifier.classify("No space left on device", "save_metadata", None),
            (ErrorCategory::Storage, Severity::Critical)
        );
    }

    #[test]
    fn test_hint_wins_over_message() {
        let classifier = ErrorClassifier::default();
        let (category, severity) = classifier.classify(
            "network unreachable",
            "extract_text",
            Some(ErrorCategory::PdfProcessing),
        );
        assert_eq!(category, ErrorCategory::PdfProcessing);
        assert_eq!(severity, Severity::Warning);
    }

    #[test]
    fn test_operation_rules_and_unknown_fallback() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify("boom", "download_pdf", None).0,
            ErrorCategory::PdfProcessing
        );
        assert_eq!(classifier.classify("boom", "save_metadata", None).0, ErrorCategory::Storage);
        assert_eq!(
            classifier.classify("boom", "mystery", None),
            (ErrorCategory::Unknown, Severity::Error)
        );
    }

    #[test]
    fn test_custom_rule_precedence() {
        let classifier = ErrorClassifier::default().with_rule(ClassificationRule::message(
            ErrorCategory::JournalSource,
            Severity::Warning,
            &["cloudflare"],
        ));
        assert_eq!(
            classifier.classify("Cloudflare connection challenge", "fetch", None),
            (ErrorCategory::JournalSource, Severity::Warning)
        );
    }

    #[test]
    fn test_detect_pattern() {
        let cases = [
            ("request timed out", ErrorCategory::Network, Some("timeout_pattern")),
            ("HTTP 429 Too Many Requests", ErrorCategory::ArxivApi, Some("rate_limit_pattern")),
            ("connection reset by peer", ErrorCategory::Network, Some("connection_pattern")),
            ("401 Unauthorized", ErrorCategory::Network, Some("authentication_pattern")),
            ("paper not found", ErrorCategory::ArxivApi, Some("not_found_pattern")),
            ("disk full", ErrorCategory::Storage, Some("disk_space_pattern")),
            ("invalid xref table", ErrorCategory::PdfProcessing, Some("corruption_pattern")),
            ("something odd", ErrorCategory::Unknown, None),
        ];
        for (message, category, expected) in cases {
            assert_eq!(detect_pattern(message, category), expected, "{}", message);
        }
    }

    #[test]
    fn test_counters_and_ring() {
        let classifier = ErrorClassifier::new(ClassifierConfig {
            recent_errors_capacity: 2,
            ..ClassifierConfig::default()
        });
        let ctx = OperationContext::new("download_pdf").with_paper("p1");

        classifier.record_error(&failed("timeout one"), &ctx);
        classifier.record_error(&failed("timeout two"), &ctx);
        classifier.record_error(&failed("disk full"), &ctx);
        classifier.record_success();

        let stats = classifier.stats();
        assert_eq!(stats.total_errors, 3);
        assert_eq!(stats.critical_errors, 1);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.pattern_counts.get("timeout_pattern"), Some(&2));
        assert_eq!(stats.recent_errors.len(), 2);
        assert_eq!(stats.recent_errors[1].message, "disk full");
        assert_eq!(stats.recent_errors[0].context.get("paper_id").map(String::as_str), Some("p1"));
        assert!(stats.last_success_time.is_some());
    }

    #[test]
    fn test_should_continue_on_consecutive_failures() {
        let classifier = ErrorClassifier::new(small_window_config());
        let ctx = OperationContext::new("download");
        for _ in 0..3 {
            classifier.record_error(&failed("boom"), &ctx);
        }
        // Three samples are below the rate minimum and the streak is under the limit
        assert!(classifier.should_continue_processing());

        classifier.record_error(&failed("boom"), &ctx);
        assert!(!classifier.should_continue_processing());
    }

    #[test]
    fn test_error_rate_needs_minimum_samples() {
        let classifier = ErrorClassifier::new(ClassifierConfig {
            max_consecutive_failures: 100,
            ..small_window_config()
        });
        let ctx = OperationContext::new("download");

        classifier.record_error(&failed("boom"), &ctx);
        classifier.record_error(&failed("boom"), &ctx);
        assert!(classifier.should_continue_processing(), "two samples are below the minimum");

        classifier.record_success();
        classifier.record_error(&failed("boom"), &ctx);
        // 3 failures of 4 samples
        assert!(!classifier.should_continue_processing());
    }

    #[test]
    fn test_window_slides() {
        let classifier = ErrorClassifier::new(ClassifierConfig {
            error_rate_window: 4,
            min_samples_for_rate: 4,
            ..ClassifierConfig::default()
        });
        let ctx = OperationContext::new("download");
        for _ in 0..4 {
            classifier.record_error(&failed("boom"), &ctx);
        }
        for _ in 0..4 {
            classifier.record_success();
        }
        assert_eq!(classifier.error_rate(), 0.0);
        assert_eq!(classifier.stats().total_errors, 4);
    }

    #[test]
    fn test_health_is_monotone() {
        let classifier = ErrorClassifier::new(ClassifierConfig {
            max_consecutive_failures: 1_000,
            ..small_window_config()
        });
        let ctx = OperationContext::new("download");
        let mut previous = classifier.health_status();
        assert_eq!(previous, HealthStatus::Healthy);

        for _ in 0..10 {
            classifier.record_error(&failed("boom"), &ctx);
            let current = classifier.health_status();
            assert!(current >= previous, "health improved after a failure");
            previous = current;
        }
        assert_eq!(previous, HealthStatus::Critical);
    }

    #[test]
    fn test_critical_errors_drive_health() {
        let classifier = ErrorClassifier::default();
        let ctx = OperationContext::new("save_metadata");
        classifier.record_success();
        classifier.record_error(&failed("out of memory"), &ctx);
        assert_eq!(classifier.health_status(), HealthStatus::Warning);
    }

    #[test]
    fn test_recommendations() {
        let classifier = ErrorClassifier::new(ClassifierConfig {
            max_consecutive_failures: 6,
            ..ClassifierConfig::default()
        });
        let ctx = OperationContext::new("fetch");
        for _ in 0..5 {
            classifier.record_error(&failed("request timed out"), &ctx);
        }

        let recs = classifier.recommendations();
        assert!(recs.iter().any(|r| r.contains("consecutive failures")));
        assert!(recs.iter().any(|r| r.contains("network errors")));
        assert!(recs.iter().any(|r| r.starts_with("Recurring timeout_pattern")));
    }

    #[tokio::test]
    async fn test_export_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("errors.json");
        let classifier = ErrorClassifier::new(ClassifierConfig {
            instance_name: Some("ai_scholar".to_string()),
            ..ClassifierConfig::default()
        });
        classifier.record_error(&failed("arxiv 503"), &OperationContext::new("discover"));

        classifier.export_report(&path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["report_type"], "error_report");
        assert_eq!(value["schema_version"], REPORT_SCHEMA_VERSION);
        assert_eq!(value["instance_name"], "ai_scholar");
        assert_eq!(value["summary"]["stats"]["total_errors"], 1);
        assert_eq!(value["summary"]["stats"]["errors_by_category"]["arxiv_api"], 1);
        assert!(value["summary"]["health_status"].is_string());
        assert!(value["summary"]["recommendations"].is_array());
    }

    #[test]
    fn test_concurrent_updates_are_counted_exactly() {
        let classifier = Arc::new(ErrorClassifier::default());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let classifier = Arc::clone(&classifier);
                std::thread::spawn(move || {
                    let ctx = OperationContext::new("download");
                    for _ in 0..50 {
                        if worker % 2 == 0 {
                            let err = OperationError::categorized(
                                ErrorCategory::Network,
                                "connection reset",
                            );
                            classifier.record_error(&err, &ctx);
                        } else {
                            classifier.record_success();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = classifier.stats();
        assert_eq!(stats.total_errors, 200);
        assert_eq!(stats.total_successes, 200);
        assert_eq!(stats.errors_by_category.get(&ErrorCategory::Network), Some(&200));
        assert_eq!(stats.errors_by_severity.values().sum::<u64>(), 200);
        assert_eq!(stats.window_samples, ClassifierConfig::default().error_rate_window);
        assert_eq!(stats.recent_errors.len(), ClassifierConfig::default().recent_errors_capacity);
    }

    #[test]
    fn test_config_validation() {
        assert!(ClassifierConfig::default().validate().is_ok());
        let bad = ClassifierConfig {
            min_samples_for_rate: 100,
            error_rate_window: 10,
            ..ClassifierConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
