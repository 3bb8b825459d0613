//! Input classification for the command surface.
//!
//! Inputs with a known alphabet (numbers, device ids, group names, command
//! tokens, callback data) are gated by their grammar. Attack signatures are a
//! second layer that runs on every input and names the category of a
//! rejection.

use serde::Serialize;

use crate::error::ValidationError;

/// Default maximum input length in characters.
pub const DEFAULT_MAX_LENGTH: usize = 4000;

/// Plausible temperature range for a stored threshold or reading.
pub const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = -100.0..=100.0;

/// SQL keywords, matched anywhere in the lower-cased text.
const SQL_KEYWORDS: &[&str] = &[
    "union", "select", "drop", "insert", "update", "delete", "exec",
];

/// SQL fragments matched as substrings.
const SQL_PHRASES: &[&str] = &[
    "' or '1'='1",
    "\" or \"1\"=\"1",
    "1=1",
    "information_schema",
    "xp_cmdshell",
    "--",
];

const PATH_TRAVERSAL: &[&str] = &["../", "..\\", "%2e%2e"];

const SHELL_SIGNATURES: &[&str] = &[
    "$(", "${", "rm ", "sudo ", "chmod ", "wget ", "curl ", "/etc/", "/bin/", "cmd.exe",
    "powershell",
];

/// Characters never accepted anywhere.
const DENY_CHARS: &[char] = &['<', '>', '&', '"', '\'', ';', '|', '`', '$'];

/// Why an input was rejected, or why an actor was penalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    RateAbuse,
    SqlPattern,
    CommandPattern,
    XssPattern,
    PathTraversal,
    LengthExceeded,
    /// The input does not fit the expected grammar and matches no attack
    /// signature. Treated as a typo, not as hostile.
    GrammarMismatch,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::RateAbuse => "rate_abuse",
            ThreatCategory::SqlPattern => "sql_pattern",
            ThreatCategory::CommandPattern => "command_pattern",
            ThreatCategory::XssPattern => "xss_pattern",
            ThreatCategory::PathTraversal => "path_traversal",
            ThreatCategory::LengthExceeded => "length_exceeded",
            ThreatCategory::GrammarMismatch => "grammar_mismatch",
        }
    }

    /// Whether this category counts as a violation against the actor.
    pub fn is_hostile(&self) -> bool {
        !matches!(self, ThreatCategory::GrammarMismatch)
    }

    pub fn severity(&self) -> Severity {
        match self {
            ThreatCategory::GrammarMismatch => Severity::Low,
            ThreatCategory::RateAbuse | ThreatCategory::LengthExceeded => Severity::Medium,
            ThreatCategory::SqlPattern
            | ThreatCategory::CommandPattern
            | ThreatCategory::XssPattern
            | ThreatCategory::PathTraversal => Severity::High,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Where the input will be used. Decides the grammar and how metacharacters
/// are categorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputContext {
    /// Free text that ends up in rendered messages.
    Display,
    /// Free text handed to system-facing code.
    System,
    /// A decimal number such as a temperature threshold.
    Numeric,
    DeviceId,
    GroupName,
    /// The leading word of a command.
    CommandToken,
    /// Button callback data, `action` or `action:argument`.
    Callback,
}

impl InputContext {
    fn grammar(&self) -> Option<fn(&str) -> bool> {
        match self {
            InputContext::Display | InputContext::System => None,
            InputContext::Numeric => Some(is_numeric),
            InputContext::DeviceId => Some(is_device_id),
            InputContext::GroupName => Some(is_group_name),
            InputContext::CommandToken => Some(is_command_token),
            InputContext::Callback => Some(is_callback_data),
        }
    }

    fn metachar_category(&self) -> ThreatCategory {
        match self {
            InputContext::Display => ThreatCategory::XssPattern,
            _ => ThreatCategory::CommandPattern,
        }
    }
}

/// Outcome of classifying one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub ok: bool,
    pub category: Option<ThreatCategory>,
    pub matched_rule: Option<String>,
}

impl Classification {
    fn safe() -> Self {
        Self {
            ok: true,
            category: None,
            matched_rule: None,
        }
    }

    fn reject(category: ThreatCategory, rule: impl Into<String>) -> Self {
        Self {
            ok: false,
            category: Some(category),
            matched_rule: Some(rule.into()),
        }
    }

    /// True when the rejection should count against the actor.
    pub fn is_hostile(&self) -> bool {
        self.category.is_some_and(|c| c.is_hostile())
    }

    pub fn into_result(self) -> Result<(), ValidationError> {
        match self.category {
            Some(category) if !self.ok => Err(ValidationError {
                category,
                rule: self.matched_rule,
            }),
            _ => Ok(()),
        }
    }
}

/// Stateless classifier for inbound text.
#[derive(Debug, Clone)]
pub struct ValidationEngine {
    max_length: usize,
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LENGTH)
    }
}

impl ValidationEngine {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Classify `text` for use in `context`.
    pub fn classify(&self, text: &str, context: InputContext) -> Classification {
        if text.chars().count() > self.max_length {
            return Classification::reject(
                ThreatCategory::LengthExceeded,
                format!("max_length={}", self.max_length),
            );
        }

        if text.trim().is_empty() {
            return Classification::reject(ThreatCategory::GrammarMismatch, "empty");
        }

        if let Some(grammar) = context.grammar()
            && !grammar(text)
        {
            return match scan_signatures(text, context) {
                Some((category, rule)) => Classification::reject(category, rule),
                None => Classification::reject(ThreatCategory::GrammarMismatch, "grammar"),
            };
        }

        match scan_signatures(text, context) {
            Some((category, rule)) => Classification::reject(category, rule),
            None => Classification::safe(),
        }
    }

    /// Classify and convert the verdict into a `Result`.
    pub fn validate(&self, text: &str, context: InputContext) -> Result<(), ValidationError> {
        self.classify(text, context).into_result()
    }
}

/// Find the most specific attack signature in `text`.
///
/// Keyword signatures outrank bare metacharacters.
fn scan_signatures(text: &str, context: InputContext) -> Option<(ThreatCategory, String)> {
    let lower = text.to_lowercase();

    if let Some(keyword) = SQL_KEYWORDS.iter().find(|k| lower.contains(**k)) {
        return Some((ThreatCategory::SqlPattern, format!("keyword:{keyword}")));
    }
    if let Some(phrase) = SQL_PHRASES.iter().find(|p| lower.contains(**p)) {
        return Some((ThreatCategory::SqlPattern, format!("phrase:{phrase}")));
    }
    if let Some(seq) = PATH_TRAVERSAL.iter().find(|p| lower.contains(**p)) {
        return Some((ThreatCategory::PathTraversal, format!("sequence:{seq}")));
    }
    if let Some(sig) = SHELL_SIGNATURES.iter().find(|p| lower.contains(**p)) {
        return Some((
            ThreatCategory::CommandPattern,
            format!("shell:{}", sig.trim_end()),
        ));
    }
    if let Some(c) = text.chars().find(|c| DENY_CHARS.contains(c)) {
        return Some((context.metachar_category(), format!("char:{c}")));
    }
    None
}

/// `[A-Za-z0-9_-]{1,50}`
pub fn is_device_id(value: &str) -> bool {
    (1..=50).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `[A-Za-z0-9 _-]{1,30}`, not only whitespace.
pub fn is_group_name(value: &str) -> bool {
    (1..=30).contains(&value.len())
        && !value.trim().is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_' || c == '-')
}

/// Optional sign, up to three integer digits, optional `.` or `,` with up to
/// two decimals.
fn is_numeric(value: &str) -> bool {
    let unsigned = value.strip_prefix(['-', '+']).unwrap_or(value);
    let (int, frac) = match unsigned.split_once(['.', ',']) {
        Some((int, frac)) => (int, Some(frac)),
        None => (unsigned, None),
    };
    let digits = |s: &str, max: usize| {
        (1..=max).contains(&s.len()) && s.chars().all(|c| c.is_ascii_digit())
    };
    digits(int, 3) && frac.is_none_or(|f| digits(f, 2))
}

/// `/?[a-z_]{1,16}`
fn is_command_token(value: &str) -> bool {
    let token = value.strip_prefix('/').unwrap_or(value);
    (1..=16).contains(&token.len()) && token.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

/// `[a-z_]{1,32}` optionally followed by `:` and a device id or group name.
fn is_callback_data(value: &str) -> bool {
    let (action, argument) = match value.split_once(':') {
        Some((action, argument)) => (action, Some(argument)),
        None => (value, None),
    };
    (1..=32).contains(&action.len())
        && action.chars().all(|c| c.is_ascii_lowercase() || c == '_')
        && argument.is_none_or(|a| is_device_id(a) || is_group_name(a))
}

/// Parse a temperature typed by a user, accepting `,` as decimal separator.
pub fn parse_temperature(value: &str) -> Option<f64> {
    if !is_numeric(value) {
        return None;
    }
    let parsed: f64 = value.replace(',', ".").parse().ok()?;
    TEMPERATURE_RANGE.contains(&parsed).then_some(parsed)
}

/// Remove denied characters, trim, and cap the length.
pub fn sanitize(text: &str, max_length: usize) -> String {
    let cleaned: String = text.chars().filter(|c| !DENY_CHARS.contains(c)).collect();
    cleaned.trim().chars().take(max_length).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ValidationEngine {
        ValidationEngine::new(64)
    }

    #[test]
    fn test_sql_injection_is_sql_pattern() {
        for context in [
            InputContext::Display,
            InputContext::System,
            InputContext::Numeric,
        ] {
            let verdict = engine().classify("1; DROP TABLE users", context);
            assert!(!verdict.ok);
            assert_eq!(verdict.category, Some(ThreatCategory::SqlPattern));
            assert!(verdict.is_hostile());
        }
    }

    #[test]
    fn test_numeric_context_accepts_decimal() {
        let verdict = engine().classify("23.5", InputContext::Numeric);
        assert!(verdict.ok);
        assert_eq!(verdict.category, None);

        assert!(engine().classify("-18,25", InputContext::Numeric).ok);
        assert!(engine().classify("+4", InputContext::Numeric).ok);
    }

    #[test]
    fn test_length_checked_before_patterns() {
        let long = format!("{}; DROP TABLE users", "a".repeat(80));
        let verdict = engine().classify(&long, InputContext::Display);
        assert_eq!(verdict.category, Some(ThreatCategory::LengthExceeded));
        assert_eq!(verdict.matched_rule.as_deref(), Some("max_length=64"));
    }

    #[test]
    fn test_metacharacter_category_depends_on_context() {
        let display = engine().classify("<b>hi</b>", InputContext::Display);
        assert_eq!(display.category, Some(ThreatCategory::XssPattern));

        let system = engine().classify("a | b", InputContext::System);
        assert_eq!(system.category, Some(ThreatCategory::CommandPattern));
    }

    #[test]
    fn test_path_traversal_and_shell() {
        let traversal = engine().classify("../../secrets", InputContext::System);
        assert_eq!(traversal.category, Some(ThreatCategory::PathTraversal));

        let shell = engine().classify("please sudo reboot", InputContext::Display);
        assert_eq!(shell.category, Some(ThreatCategory::CommandPattern));
    }

    #[test]
    fn test_grammar_mismatch_is_not_hostile() {
        let verdict = engine().classify("twenty", InputContext::Numeric);
        assert!(!verdict.ok);
        assert_eq!(verdict.category, Some(ThreatCategory::GrammarMismatch));
        assert!(!verdict.is_hostile());

        let empty = engine().classify("   ", InputContext::Display);
        assert_eq!(empty.category, Some(ThreatCategory::GrammarMismatch));
    }

    #[test]
    fn test_keywords_match_inside_words() {
        for text in ["dropdb now", "reselect all", "xupdatex", "EXECUTE it"] {
            for context in [InputContext::Display, InputContext::System] {
                let verdict = engine().classify(text, context);
                assert!(!verdict.ok, "{text}");
                assert_eq!(verdict.category, Some(ThreatCategory::SqlPattern), "{text}");
            }
        }

        let device = engine().classify("selector-1", InputContext::DeviceId);
        assert_eq!(device.category, Some(ThreatCategory::SqlPattern));
        assert!(engine().classify("Cold Room 2", InputContext::GroupName).ok);
    }

    #[test]
    fn test_grammar_helpers() {
        assert!(is_device_id("dev_01-A"));
        assert!(!is_device_id("dev 01"));
        assert!(!is_device_id(&"x".repeat(51)));

        assert!(is_group_name("Warehouse 3"));
        assert!(!is_group_name("Warehouse/3"));

        assert!(is_command_token("/status"));
        assert!(!is_command_token("Status"));

        assert!(is_callback_data("group:Warehouse 3"));
        assert!(is_callback_data("status"));
        assert!(!is_callback_data("group:../etc"));
    }

    #[test]
    fn test_parse_temperature() {
        assert_eq!(parse_temperature("23.5"), Some(23.5));
        assert_eq!(parse_temperature("-4,5"), Some(-4.5));
        assert_eq!(parse_temperature("150"), None);
        assert_eq!(parse_temperature("1e3"), None);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("  <hello>; world  ", 100), "hello world");
        assert_eq!(sanitize("abcdef", 3), "abc");
    }

    #[test]
    fn test_into_result() {
        assert!(engine().validate("status", InputContext::CommandToken).is_ok());
        let err = engine()
            .validate("1 union select", InputContext::Display)
            .unwrap_err();
        assert_eq!(err.category, ThreatCategory::SqlPattern);
    }
}
