//! Error classification: maps a handler failure to a retry class.
//!
//! Classification is an ordered rule list. Structured signals (a class hint
//! supplied by the handler, error codes, HTTP statuses) are checked first across
//! every rule, in priority order; free-text patterns are only consulted when no
//! structured signal matched. Unmatched errors fall back to `Transient`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::retry::DEFAULT_RATE_LIMIT_DELAY_MS;

/// Retry class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Malformed or corrupted content; never retried, dead-lettered immediately.
    Poison,
    Validation,
    Auth,
    Conflict,
    RateLimited,
    Transient,
}

impl ErrorClass {
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            ErrorClass::Conflict | ErrorClass::RateLimited | ErrorClass::Transient
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Poison => "POISON",
            ErrorClass::Validation => "VALIDATION",
            ErrorClass::Auth => "AUTH",
            ErrorClass::Conflict => "CONFLICT",
            ErrorClass::RateLimited => "RATE_LIMITED",
            ErrorClass::Transient => "TRANSIENT",
        }
    }
}

impl core::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// HTTP status of the failed upstream call, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Raw retry-after value (seconds or a timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Class supplied directly by the handler; wins over every rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_hint: Option<ErrorClass>,
}

impl JobError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            status: None,
            retry_after: None,
            headers: BTreeMap::new(),
            stack: None,
            class_hint: None,
        }
    }

    /// A plain `Error` with only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// A failure the handler already knows the class of.
    pub fn classified(class: ErrorClass, message: impl Into<String>) -> Self {
        Self::message(message).with_class(class)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class_hint = Some(class);
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Result of classifying a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub class: ErrorClass,
    pub should_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    pub move_to_dlq: bool,
    pub message: String,
}

/// One entry of the ordered rule list.
#[derive(Debug, Clone)]
pub struct ClassifierRule {
    pub class: ErrorClass,
    pub codes: Vec<String>,
    pub statuses: Vec<u16>,
    pub pattern: Option<Regex>,
}

impl ClassifierRule {
    pub fn new(class: ErrorClass) -> Self {
        Self {
            class,
            codes: Vec::new(),
            statuses: Vec::new(),
            pattern: None,
        }
    }

    pub fn codes(mut self, codes: &[&str]) -> Self {
        self.codes = codes.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn statuses(mut self, statuses: &[u16]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    /// Case-insensitive pattern matched against `name: message`.
    ///
    /// Invalid patterns are a programming error in the rule table and panic at
    /// construction time.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(Regex::new(&format!("(?i){pattern}")).expect("invalid classifier pattern"));
        self
    }

    fn matches_structured(&self, error: &JobError) -> bool {
        let code_hit = error
            .code
            .as_deref()
            .is_some_and(|code| self.codes.iter().any(|c| c.eq_ignore_ascii_case(code)));
        let status_hit = error.status.is_some_and(|s| self.statuses.contains(&s));
        code_hit || status_hit
    }

    fn matches_text(&self, haystack: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(haystack))
    }
}

/// Ordered-rule classifier.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassifierRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

fn default_rules() -> Vec<ClassifierRule> {
    vec![
        ClassifierRule::new(ErrorClass::Poison)
            .codes(&["EPARSE", "EBADMSG", "EMSGSIZE"])
            .pattern(r"malformed|corrupt|unexpected (token|end|content|character)|unparseable|poison"),
        ClassifierRule::new(ErrorClass::Validation)
            .statuses(&[400, 422])
            .pattern(r"invalid|bad request|validation"),
        ClassifierRule::new(ErrorClass::Auth)
            .statuses(&[401, 403])
            .pattern(r"unauthori[sz]ed|forbidden|\btoken\b"),
        ClassifierRule::new(ErrorClass::Conflict)
            .statuses(&[409])
            .pattern(r"conflict|version mismatch"),
        ClassifierRule::new(ErrorClass::RateLimited)
            .statuses(&[429])
            .pattern(r"rate.?limit|too many requests"),
        ClassifierRule::new(ErrorClass::Transient)
            .codes(&["ECONNREFUSED", "ETIMEDOUT", "ECONNRESET", "EAI_AGAIN", "EPIPE"])
            .statuses(&[502, 503, 504])
            .pattern(r"network|timeout|timed out|socket hang up|temporarily unavailable"),
    ]
}

impl ErrorClassifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        Self { rules }
    }

    /// Insert a rule ahead of the built-in ones.
    pub fn with_rule_first(mut self, rule: ClassifierRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn classify(&self, error: &JobError) -> Classification {
        let class = self.resolve_class(error);
        let retry_after_ms = match class {
            ErrorClass::RateLimited => {
                Some(extract_retry_after_ms(error, Utc::now()).unwrap_or(DEFAULT_RATE_LIMIT_DELAY_MS))
            }
            _ => None,
        };

        Classification {
            class,
            should_retry: class.should_retry(),
            retry_after_ms,
            move_to_dlq: class == ErrorClass::Poison,
            message: error.message.clone(),
        }
    }

    fn resolve_class(&self, error: &JobError) -> ErrorClass {
        if let Some(hint) = error.class_hint {
            return hint;
        }
        if let Some(rule) = self.rules.iter().find(|r| r.matches_structured(error)) {
            return rule.class;
        }
        let haystack = format!("{}: {}", error.name, error.message);
        self.rules
            .iter()
            .find(|r| r.matches_text(&haystack))
            .map(|r| r.class)
            .unwrap_or(ErrorClass::Transient)
    }
}

/// Classify with the built-in rule table.
pub fn classify(error: &JobError) -> Classification {
    static DEFAULT: OnceLock<ErrorClassifier> = OnceLock::new();
    DEFAULT.get_or_init(ErrorClassifier::default).classify(error)
}

/// Pull an explicit retry-after out of the error, in milliseconds from `now`.
///
/// Sources, first hit wins: the error's own retry-after value, a `Retry-After`
/// header, an `X-RateLimit-Reset` header, then a "retry after N" phrase in the
/// message. Values may be seconds, an RFC 3339 timestamp or an HTTP date.
pub fn extract_retry_after_ms(error: &JobError, now: DateTime<Utc>) -> Option<u64> {
    if let Some(ms) = error.retry_after.as_deref().and_then(|v| parse_delay_value(v, now)) {
        return Some(ms);
    }
    if let Some(ms) = error.header("retry-after").and_then(|v| parse_delay_value(v, now)) {
        return Some(ms);
    }
    if let Some(ms) = error.header("x-ratelimit-reset").and_then(|v| parse_reset_value(v, now)) {
        return Some(ms);
    }

    static PHRASE: OnceLock<Regex> = OnceLock::new();
    let phrase = PHRASE.get_or_init(|| {
        Regex::new(r"(?i)retry[- ]after[:\s]+(\d+)").expect("static regex")
    });
    phrase
        .captures(&error.message)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .map(|secs| secs.saturating_mul(1000))
}

fn parse_delay_value(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0).round() as u64);
    }
    parse_timestamp(value).map(|at| millis_until(at, now))
}

/// `X-RateLimit-Reset` is either epoch seconds, a delta in seconds, or a timestamp.
fn parse_reset_value(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if let Ok(n) = value.parse::<i64>() {
        if n > 1_000_000_000 {
            let at = DateTime::<Utc>::from_timestamp(n, 0)?;
            return Some(millis_until(at, now));
        }
        return u64::try_from(n).ok().map(|secs| secs.saturating_mul(1000));
    }
    parse_timestamp(value).map(|at| millis_until(at, now))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_rfc2822(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn millis_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((at - now).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn parse_errors_are_poison_and_go_straight_to_dlq() {
        let c = classify(&JobError::new("SyntaxError", "Unexpected token < in JSON at position 0"));
        assert_eq!(c.class, ErrorClass::Poison);
        assert!(!c.should_retry);
        assert!(c.move_to_dlq);

        let c = classify(&JobError::message("boom").with_code("EMSGSIZE"));
        assert_eq!(c.class, ErrorClass::Poison);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let c = classify(&JobError::message("request failed").with_status(422));
        assert_eq!(c.class, ErrorClass::Validation);
        assert!(!c.should_retry);
        assert!(!c.move_to_dlq);

        let c = classify(&JobError::message("Unauthorized: token expired"));
        assert_eq!(c.class, ErrorClass::Auth);
        assert!(!c.should_retry);
    }

    #[test]
    fn structured_status_beats_text_patterns() {
        // The message mentions a token, but the 429 is authoritative.
        let c = classify(&JobError::message("rate limit exceeded for api token").with_status(429));
        assert_eq!(c.class, ErrorClass::RateLimited);
    }

    #[test]
    fn conflicts_are_retried() {
        let c = classify(&JobError::message("version mismatch on post 12"));
        assert_eq!(c.class, ErrorClass::Conflict);
        assert!(c.should_retry);
    }

    #[test]
    fn network_failures_and_unknowns_are_transient() {
        let c = classify(&JobError::message("connect failed").with_code("ECONNREFUSED"));
        assert_eq!(c.class, ErrorClass::Transient);
        assert!(c.should_retry);

        let c = classify(&JobError::message("something odd happened"));
        assert_eq!(c.class, ErrorClass::Transient);
    }

    #[test]
    fn class_hint_wins() {
        let c = classify(&JobError::classified(ErrorClass::Validation, "upstream timeout"));
        assert_eq!(c.class, ErrorClass::Validation);
    }

    #[test]
    fn rate_limit_defaults_to_sixty_seconds() {
        let c = classify(&JobError::message("Too Many Requests"));
        assert_eq!(c.class, ErrorClass::RateLimited);
        assert_eq!(c.retry_after_ms, Some(60_000));
    }

    #[test]
    fn rate_limit_honors_numeric_retry_after() {
        let c = classify(&JobError::message("slow down").with_status(429).with_retry_after("12"));
        assert_eq!(c.retry_after_ms, Some(12_000));
    }

    #[test]
    fn retry_after_header_and_reset_header_are_read() {
        let now = Utc::now();
        let err = JobError::message("x").with_header("Retry-After", "3");
        assert_eq!(extract_retry_after_ms(&err, now), Some(3_000));

        let reset_at = now + Duration::seconds(30);
        let err = JobError::message("x")
            .with_header("X-RateLimit-Reset", reset_at.timestamp().to_string());
        let ms = extract_retry_after_ms(&err, now).unwrap();
        assert!((29_000..=30_000).contains(&ms), "got {ms}");
    }

    #[test]
    fn retry_after_timestamp_is_converted_to_delay() {
        let now = Utc::now();
        let at = (now + Duration::seconds(90)).to_rfc3339();
        let err = JobError::message("x").with_retry_after(at);
        let ms = extract_retry_after_ms(&err, now).unwrap();
        assert!((89_000..=90_000).contains(&ms), "got {ms}");

        let past = (now - Duration::seconds(5)).to_rfc3339();
        let err = JobError::message("x").with_retry_after(past);
        assert_eq!(extract_retry_after_ms(&err, now), Some(0));
    }

    #[test]
    fn retry_after_phrase_in_message() {
        let err = JobError::message("quota hit, retry after 7 seconds");
        assert_eq!(extract_retry_after_ms(&err, Utc::now()), Some(7_000));
    }

    #[test]
    fn custom_rules_take_precedence() {
        let classifier = ErrorClassifier::default()
            .with_rule_first(ClassifierRule::new(ErrorClass::Auth).codes(&["E_TOKEN_REVOKED"]));
        let c = classifier.classify(&JobError::message("timeout").with_code("E_TOKEN_REVOKED"));
        assert_eq!(c.class, ErrorClass::Auth);
    }
}
