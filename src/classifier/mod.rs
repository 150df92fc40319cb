//! Error classification
//!
//! Turns raw backend error text into a short message, a type tag and a map of
//! structured details. The wording of the backend is described by a
//! [`DiagnosticDialect`]: an ordered list of [`Rule`]s, most specific first.
//! The first rule whose pattern matches and whose extractor succeeds wins; an
//! extractor returning `None` is treated as no match and the search continues.
//! When no rule applies, the first meaningful line of the raw text is used.
//!
//! Classification never fails and never panics. Callers keep the raw text
//! next to the diagnostic.

use crate::config::DiagnosticsConfig;
use regex::{Captures, Regex};
use serde::Serialize;

pub mod spark;
pub mod sqlite;

pub use spark::SparkDialect;
pub use sqlite::SqliteDialect;

/// Type tag used when no rule matched.
pub const GENERIC_ERROR_TYPE: &str = "Database Error";

/// Classified form of a raw error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    pub message: String,
    pub error_type: String,
    pub details: Option<ErrorDetails>,
}

/// Structured details pulled out of an error.
///
/// `line` and `position` are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub near_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub literal_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_snippet: Option<String>,
}

impl ErrorDetails {
    pub fn is_empty(&self) -> bool {
        *self == ErrorDetails::default()
    }
}

/// Length bounds applied while extracting.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_message_len: usize,
    pub snippet_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits::from(&DiagnosticsConfig::default())
    }
}

impl From<&DiagnosticsConfig> for Limits {
    fn from(config: &DiagnosticsConfig) -> Self {
        Limits {
            max_message_len: config.max_message_len.max(1),
            snippet_len: config.snippet_len,
        }
    }
}

/// What an extractor produces on success.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub message: String,
    pub details: ErrorDetails,
}

/// Builds a diagnostic from a rule's captures and the full raw text.
pub type Extractor = fn(&Captures<'_>, &str, &Limits) -> Option<Extracted>;

/// One entry of a dialect's ordered rule list.
pub struct Rule {
    pub name: &'static str,
    pub error_type: &'static str,
    pub pattern: Regex,
    pub extract: Extractor,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("error_type", &self.error_type)
            .field("pattern", &self.pattern.as_str())
            .finish()
    }
}

/// Backend-specific error wording.
pub trait DiagnosticDialect: Send + Sync {
    fn name(&self) -> &str;

    /// Rules in priority order.
    fn rules(&self) -> &[Rule];
}

/// Applies a dialect's rules to raw error text.
pub struct Classifier {
    dialect: Box<dyn DiagnosticDialect>,
    limits: Limits,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("dialect", &self.dialect.name())
            .field("limits", &self.limits)
            .finish()
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Classifier::new(Box::new(SparkDialect::new()), Limits::default())
    }
}

impl Classifier {
    pub fn new(dialect: Box<dyn DiagnosticDialect>, limits: Limits) -> Self {
        Classifier { dialect, limits }
    }

    /// Picks the dialect matching a driver name; Spark wording otherwise.
    pub fn for_driver(driver_name: &str, config: &DiagnosticsConfig) -> Self {
        let dialect: Box<dyn DiagnosticDialect> = match driver_name {
            "sqlite" => Box::new(SqliteDialect::new()),
            _ => Box::new(SparkDialect::new()),
        };
        Classifier::new(dialect, Limits::from(config))
    }

    pub fn dialect_name(&self) -> &str {
        self.dialect.name()
    }

    /// Classifies `raw`. Always returns a non-empty message.
    pub fn classify(&self, raw: &str) -> Diagnostic {
        for rule in self.dialect.rules() {
            let Some(captures) = rule.pattern.captures(raw) else {
                continue;
            };
            let Some(extracted) = (rule.extract)(&captures, raw, &self.limits) else {
                tracing::trace!(rule = rule.name, "extractor declined match");
                continue;
            };
            if extracted.message.trim().is_empty() {
                continue;
            }
            let details = (!extracted.details.is_empty()).then_some(extracted.details);
            return Diagnostic {
                message: truncate_chars(extracted.message.trim(), self.limits.max_message_len),
                error_type: rule.error_type.to_string(),
                details,
            };
        }

        Diagnostic {
            message: fallback_message(raw, self.limits.max_message_len),
            error_type: GENERIC_ERROR_TYPE.to_string(),
            details: None,
        }
    }
}

/// First line that is not a stack frame, bounded; the raw text otherwise.
pub fn fallback_message(raw: &str, max_len: usize) -> String {
    let first_meaningful = raw
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !is_stack_frame(line));

    match first_meaningful {
        Some(line) => truncate_chars(line, max_len),
        None if !raw.trim().is_empty() => truncate_chars(raw.trim(), max_len),
        None => truncate_chars("Unknown error", max_len),
    }
}

fn is_stack_frame(line: &str) -> bool {
    line.starts_with("at ")
        || (line.starts_with("...") && line.ends_with("more"))
        || line.starts_with("File \"")
        || line == "Traceback (most recent call last):"
}

/// Truncates to at most `max` characters, marking the cut with `...` when
/// the bound leaves room for it.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    if max <= 3 {
        return text.chars().take(max).collect();
    }
    let mut out: String = text.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

/// Removes identifier quoting: `` `a`.`b` `` becomes `a.b`.
pub(crate) fn unquote_identifier(name: &str) -> String {
    name.trim_matches(|c: char| c == '.' || c == ',' || c == ';')
        .chars()
        .filter(|c| !matches!(c, '`' | '"' | '\''))
        .collect()
}
