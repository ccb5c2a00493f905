/// Output classification: map raw subprocess output and exit codes onto a
/// closed taxonomy of conditions.
///
/// Matching is case-insensitive regex against a priority-ordered table, so a
/// specific tag (token limit, rate limit, auth, unavailable) always wins over
/// `GenericError` when a chunk matches both. Looks for patterns like:
/// - token limit: `token limit`, `exceeded.*token`, `output token maximum`
/// - rate limit: `rate limit`, `too many requests`, `429`, `usage limit`
/// - auth: `unauthorized`, `invalid api key`, `401`, `403`
/// - unavailable: `service unavailable`, `503`, `overloaded`
use crate::config::ClassifierConfig;
use regex::Regex;
use std::sync::LazyLock;

/// Verdict on one chunk of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationTag {
    Normal,
    TokenLimitExceeded,
    RateLimitExceeded,
    AuthFailure,
    ServiceUnavailable,
    GenericError,
}

impl ClassificationTag {
    /// Anything other than plain output.
    pub fn is_error(self) -> bool {
        self != ClassificationTag::Normal
    }
}

static TOKEN_LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)token limit").unwrap(),
        Regex::new(r"(?i)exceeded.*token").unwrap(),
        Regex::new(r"(?i)output token maximum").unwrap(),
        Regex::new(r"(?i)Claude's response exceeded").unwrap(),
    ]
});

static RATE_LIMIT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r#""error"\s*:\s*"rate_limit""#).unwrap(),
        Regex::new(r"(?i)rate limit").unwrap(),
        Regex::new(r"(?i)too many requests").unwrap(),
        Regex::new(r"\b429\b").unwrap(),
        Regex::new(r"(?i)usage limit").unwrap(),
        Regex::new(r"(?i)hit your limit").unwrap(),
    ]
});

static AUTH_FAILURE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)authentication (failed|error)").unwrap(),
        Regex::new(r"(?i)unauthorized").unwrap(),
        Regex::new(r"(?i)invalid api key").unwrap(),
        Regex::new(r"\b401\b").unwrap(),
        Regex::new(r"\b403\b").unwrap(),
    ]
});

static SERVICE_UNAVAILABLE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)service unavailable").unwrap(),
        Regex::new(r"\b503\b").unwrap(),
        Regex::new(r"(?i)overloaded").unwrap(),
        Regex::new(r"(?i)connection refused").unwrap(),
    ]
});

static GENERIC_ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)^\s*error:").unwrap(),
        Regex::new(r"(?i)^\s*fatal:").unwrap(),
        Regex::new(r"(?i)traceback \(most recent call last\)").unwrap(),
        Regex::new(r"panicked at").unwrap(),
    ]
});

static RETRY_AFTER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)retry-after[:"]\s*(\d+)"#).unwrap());

/// Fallback wait when a rate limit matched but carried no Retry-After value.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Suggestion shipped with token-limit notifications.
pub const TOKEN_LIMIT_SUGGESTION: &str =
    "Reduce the requested output size or split the task into smaller steps";

const MAX_REPORT_CHARS: usize = 500;

/// First non-normal classification seen during an execution, kept for the
/// dedicated error notification and the terminal success verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub tag: ClassificationTag,
    /// The offending chunk, trimmed and capped.
    pub message: String,
    /// Only set for rate limits.
    pub retry_after: Option<u64>,
}

/// Priority-ordered pattern table, built once per server from the built-in
/// patterns plus any configured extras.
pub struct OutputClassifier {
    table: Vec<(Regex, ClassificationTag)>,
    token_limit: u64,
}

impl OutputClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        use ClassificationTag::*;
        let mut table = Vec::new();
        push_tier(&mut table, &TOKEN_LIMIT_PATTERNS, &config.token_limit_patterns, TokenLimitExceeded);
        push_tier(&mut table, &RATE_LIMIT_PATTERNS, &config.rate_limit_patterns, RateLimitExceeded);
        push_tier(&mut table, &AUTH_FAILURE_PATTERNS, &config.auth_failure_patterns, AuthFailure);
        push_tier(
            &mut table,
            &SERVICE_UNAVAILABLE_PATTERNS,
            &config.service_unavailable_patterns,
            ServiceUnavailable,
        );
        push_tier(&mut table, &GENERIC_ERROR_PATTERNS, &config.generic_error_patterns, GenericError);
        Self {
            table,
            token_limit: config.token_limit,
        }
    }

    /// Classify one chunk of output. Pure; first table hit wins.
    pub fn classify(&self, text: &str) -> ClassificationTag {
        for (pattern, tag) in &self.table {
            if pattern.is_match(text) {
                tracing::debug!(pattern = %pattern, ?tag, "classifier pattern matched");
                return *tag;
            }
        }
        ClassificationTag::Normal
    }

    /// End-of-run success verdict: exit 0 with no error classification.
    ///
    /// Cancellation is scored by the executor before this is consulted, so
    /// a cancelled run never reaches here as a failure.
    pub fn classify_exit(&self, exit_code: i32, first_error: Option<ClassificationTag>) -> bool {
        exit_code == 0 && first_error.is_none()
    }

    /// Build the report for the first error classification of a run.
    pub fn report(&self, tag: ClassificationTag, text: &str) -> ErrorReport {
        let message: String = text.trim().chars().take(MAX_REPORT_CHARS).collect();
        let retry_after = match tag {
            ClassificationTag::RateLimitExceeded => {
                Some(extract_retry_after(text).unwrap_or(DEFAULT_RETRY_AFTER_SECS))
            }
            _ => None,
        };
        ErrorReport {
            tag,
            message,
            retry_after,
        }
    }

    /// Token budget reported in token-limit notifications.
    pub fn token_limit(&self) -> u64 {
        self.token_limit
    }
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

fn push_tier(
    table: &mut Vec<(Regex, ClassificationTag)>,
    builtin: &[Regex],
    extra: &[String],
    tag: ClassificationTag,
) {
    for pattern in builtin {
        table.push((pattern.clone(), tag));
    }
    for raw in extra {
        match Regex::new(&format!("(?i){raw}")) {
            Ok(re) => table.push((re, tag)),
            Err(e) => {
                tracing::warn!(pattern = %raw, error = %e, "ignoring invalid classifier pattern");
            }
        }
    }
}

/// Pull a `Retry-After: <secs>` value out of a rate-limit chunk.
pub fn extract_retry_after(text: &str) -> Option<u64> {
    RETRY_AFTER_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
