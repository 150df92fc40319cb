//! Spark / Hive error wording.
//!
//! Covers both the error-class style (`[TABLE_OR_VIEW_NOT_FOUND] ...`) and the
//! older free-text messages still produced through the Hive thrift server.

use super::{
    truncate_chars, unquote_identifier, DiagnosticDialect, ErrorDetails, Extracted, Limits, Rule,
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static LINE_POS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)line\s+(\d+),?\s+pos\s+(\d+)").expect("valid regex"));

static SQL_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)== SQL(?: \(line \d+, position \d+\))? ==\s*\n(.*?)(?:\n\s*\n|\n\s*at |\z)")
        .expect("valid regex")
});

/// The default dialect.
pub struct SparkDialect {
    rules: Vec<Rule>,
}

impl Default for SparkDialect {
    fn default() -> Self {
        SparkDialect::new()
    }
}

impl SparkDialect {
    pub fn new() -> Self {
        let rules = vec![
            rule(
                "table_or_view_not_found",
                "Table Not Found",
                r"(?is)\[TABLE_OR_VIEW_NOT_FOUND\].*?table or view\s+(?P<name>\S+?)\s+cannot be found",
                extract_table,
            ),
            rule(
                "table_not_found_legacy",
                "Table Not Found",
                r"(?i)Table or view not found:\s*(?P<name>[^\s;]+)",
                extract_table,
            ),
            rule(
                "unresolved_column",
                "Column Not Found",
                r"(?is)\[UNRESOLVED_COLUMN(?:\.\w+)?\].*?with name\s+(?P<name>\S+?)\s+cannot be resolved(?:.*?Did you mean one of the following\?\s*\[(?P<suggestions>[^\]]*)\])?",
                extract_column,
            ),
            rule(
                "unresolved_column_legacy",
                "Column Not Found",
                r"(?is)cannot resolve\s+(?P<name>'[^']+'|`[^`]+`|\S+)\s+given input columns:\s*\[(?P<suggestions>[^\]]*)\]",
                extract_column,
            ),
            rule(
                "parse_syntax_error",
                "Syntax Error",
                r"(?is)\[PARSE_SYNTAX_ERROR\]\s*Syntax error at or near\s+(?P<token>'[^']*'|\S+)",
                extract_syntax,
            ),
            rule(
                "parse_syntax_error_legacy",
                "Syntax Error",
                r"(?is)(?:mismatched|extraneous|no viable alternative at) input\s+(?P<token>'[^']*'|\S+)",
                extract_syntax,
            ),
            rule(
                "invalid_typed_literal",
                "Invalid Literal",
                r#"(?is)\[INVALID_TYPED_LITERAL\].*?typed literal\s+"?(?P<kind>\w+)"?\s+is invalid:\s*'(?P<literal>[^']*)'"#,
                extract_literal,
            ),
            rule(
                "analysis_exception",
                "Analysis Error",
                r"(?m)AnalysisException:\s*(?P<message>.+)$",
                extract_message,
            ),
            rule(
                "query_exception",
                "Query Error",
                r"(?m)(?:HiveSQLException|Error running query):\s*(?P<message>.+)$",
                extract_message,
            ),
        ];
        SparkDialect { rules }
    }
}

impl DiagnosticDialect for SparkDialect {
    fn name(&self) -> &str {
        "spark"
    }

    fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

fn rule(
    name: &'static str,
    error_type: &'static str,
    pattern: &str,
    extract: super::Extractor,
) -> Rule {
    Rule {
        name,
        error_type,
        pattern: Regex::new(pattern).expect("dialect patterns are valid"),
        extract,
    }
}

/// 1-based line and column from Spark's `line L, pos P` (P is 0-based).
fn line_and_position(raw: &str) -> Option<(u32, u32)> {
    let caps = LINE_POS.captures(raw)?;
    let line = caps.get(1)?.as_str().parse::<u32>().ok()?;
    let pos = caps.get(2)?.as_str().parse::<u32>().ok()?;
    Some((line, pos.checked_add(1)?))
}

fn sql_snippet(raw: &str, limits: &Limits) -> Option<String> {
    if limits.snippet_len == 0 {
        return None;
    }
    let block = SQL_BLOCK.captures(raw)?.get(1)?.as_str().trim_end();
    if block.trim().is_empty() {
        return None;
    }
    Some(truncate_chars(block, limits.snippet_len))
}

fn location_suffix(details: &ErrorDetails) -> String {
    match (details.line, details.position) {
        (Some(line), Some(position)) => format!(" (line {}, column {})", line, position),
        _ => String::new(),
    }
}

fn extract_table(caps: &Captures<'_>, raw: &str, _limits: &Limits) -> Option<Extracted> {
    let name = unquote_identifier(caps.name("name")?.as_str());
    if name.is_empty() {
        return None;
    }
    let mut details = ErrorDetails {
        table_name: Some(name.clone()),
        ..ErrorDetails::default()
    };
    if let Some((line, position)) = line_and_position(raw) {
        details.line = Some(line);
        details.position = Some(position);
    }
    Some(Extracted {
        message: format!(
            "Table or view '{}' not found{}. Check the name and schema.",
            name,
            location_suffix(&details)
        ),
        details,
    })
}

fn extract_column(caps: &Captures<'_>, raw: &str, _limits: &Limits) -> Option<Extracted> {
    let name = unquote_identifier(caps.name("name")?.as_str());
    if name.is_empty() {
        return None;
    }
    let suggestions: Vec<String> = caps
        .name("suggestions")
        .map(|list| {
            list.as_str()
                .split(',')
                .map(unquote_identifier)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut message = format!("Column '{}' cannot be resolved", name);
    if !suggestions.is_empty() {
        message.push_str(&format!(". Did you mean: {}?", suggestions.join(", ")));
    }

    let mut details = ErrorDetails {
        column_name: Some(name),
        suggestions: (!suggestions.is_empty()).then_some(suggestions),
        ..ErrorDetails::default()
    };
    if let Some((line, position)) = line_and_position(raw) {
        details.line = Some(line);
        details.position = Some(position);
    }
    Some(Extracted { message, details })
}

fn extract_syntax(caps: &Captures<'_>, raw: &str, limits: &Limits) -> Option<Extracted> {
    let token = caps
        .name("token")?
        .as_str()
        .trim_matches('\'')
        .trim_end_matches(&['.', ','][..])
        .to_string();
    let (line, position) = line_and_position(raw)?;

    let details = ErrorDetails {
        line: Some(line),
        position: Some(position),
        near_token: (!token.is_empty()).then(|| token.clone()),
        sql_snippet: sql_snippet(raw, limits),
        ..ErrorDetails::default()
    };
    let near = if token.is_empty() {
        "end of input".to_string()
    } else {
        format!("'{}'", token)
    };
    Some(Extracted {
        message: format!("Syntax error at or near {}{}", near, location_suffix(&details)),
        details,
    })
}

fn extract_literal(caps: &Captures<'_>, _raw: &str, _limits: &Limits) -> Option<Extracted> {
    let kind = caps.name("kind")?.as_str().to_uppercase();
    let literal = caps.name("literal")?.as_str().to_string();
    Some(Extracted {
        message: format!("Invalid {} literal: '{}'", kind, literal),
        details: ErrorDetails {
            literal: Some(literal),
            literal_type: Some(kind),
            ..ErrorDetails::default()
        },
    })
}

fn extract_message(caps: &Captures<'_>, raw: &str, _limits: &Limits) -> Option<Extracted> {
    let text = caps.name("message")?.as_str().trim();
    // Drop Spark's trailing plan location; it is reported as details.
    let text = text.split(";;").next().unwrap_or(text).trim_end_matches(';').trim();
    if text.is_empty() {
        return None;
    }
    let mut details = ErrorDetails::default();
    if let Some((line, position)) = line_and_position(raw) {
        details.line = Some(line);
        details.position = Some(position);
    }
    Some(Extracted {
        message: text.to_string(),
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::super::{Classifier, GENERIC_ERROR_TYPE};
    use super::*;
    use insta::assert_snapshot;

    fn classify(raw: &str) -> super::super::Diagnostic {
        Classifier::default().classify(raw)
    }

    #[test]
    fn test_table_not_found() {
        let raw = "[Simba][Hardy] (80) Syntax or semantic analysis error thrown in server while executing query. \
                   Error message from server: org.apache.hive.service.cli.HiveSQLException: \
                   Error running query: [TABLE_OR_VIEW_NOT_FOUND] org.apache.spark.sql.AnalysisException: \
                   [TABLE_OR_VIEW_NOT_FOUND] The table or view `foo.bar` cannot be found. \
                   Verify the spelling and correctness of the schema and catalog.; line 1 pos 14";
        let diagnostic = classify(raw);
        assert_eq!(diagnostic.error_type, "Table Not Found");
        let details = diagnostic.details.unwrap();
        assert_eq!(details.table_name.as_deref(), Some("foo.bar"));
        assert_eq!(details.line, Some(1));
        assert_eq!(details.position, Some(15));
    }

    #[test]
    fn test_table_not_found_quoted_parts() {
        let diagnostic =
            classify("[TABLE_OR_VIEW_NOT_FOUND] The table or view `sales`.`orders` cannot be found.");
        assert_eq!(
            diagnostic.details.unwrap().table_name.as_deref(),
            Some("sales.orders")
        );
        assert_snapshot!(diagnostic.message, @"Table or view 'sales.orders' not found. Check the name and schema.");
    }

    #[test]
    fn test_table_not_found_legacy() {
        let diagnostic = classify("Error in SQL statement: AnalysisException: Table or view not found: db.missing; line 1 pos 14");
        assert_eq!(diagnostic.error_type, "Table Not Found");
        assert_eq!(diagnostic.details.unwrap().table_name.as_deref(), Some("db.missing"));
    }

    #[test]
    fn test_unresolved_column_with_suggestions() {
        let raw = "org.apache.spark.sql.AnalysisException: [UNRESOLVED_COLUMN.WITH_SUGGESTION] \
                   A column or function parameter with name `amout` cannot be resolved. \
                   Did you mean one of the following? [`amount`, `account_id`, `id`].; line 1 pos 7";
        let diagnostic = classify(raw);
        assert_eq!(diagnostic.error_type, "Column Not Found");
        let details = diagnostic.details.unwrap();
        assert_eq!(details.column_name.as_deref(), Some("amout"));
        assert_eq!(
            details.suggestions.unwrap(),
            vec!["amount".to_string(), "account_id".to_string(), "id".to_string()]
        );
        assert_snapshot!(diagnostic.message, @"Column 'amout' cannot be resolved. Did you mean: amount, account_id, id?");
    }

    #[test]
    fn test_unresolved_column_legacy() {
        let diagnostic = classify("cannot resolve 'nme' given input columns: [t.id, t.name]; line 1 pos 7");
        assert_eq!(diagnostic.error_type, "Column Not Found");
        let details = diagnostic.details.unwrap();
        assert_eq!(details.column_name.as_deref(), Some("nme"));
        assert_eq!(
            details.suggestions.unwrap(),
            vec!["t.id".to_string(), "t.name".to_string()]
        );
    }

    #[test]
    fn test_syntax_error_with_snippet() {
        let raw = "[PARSE_SYNTAX_ERROR] Syntax error at or near 'FROM'.(line 1, pos 9)\n\n== SQL ==\nSELECT a, FROM t\n---------^^^\n";
        let diagnostic = classify(raw);
        assert_eq!(diagnostic.error_type, "Syntax Error");
        let details = diagnostic.details.unwrap();
        assert_eq!(details.line, Some(1));
        assert_eq!(details.position, Some(10));
        assert_eq!(details.near_token.as_deref(), Some("FROM"));
        assert_eq!(
            details.sql_snippet.as_deref(),
            Some("SELECT a, FROM t\n---------^^^")
        );
        assert_eq!(diagnostic.message, "Syntax error at or near 'FROM' (line 1, column 10)");
    }

    #[test]
    fn test_syntax_error_without_location_falls_through() {
        // The extractor needs a location; without one the match is declined.
        let diagnostic = classify("mismatched input 'SELEC' expecting {'(', 'SELECT'}");
        assert_ne!(diagnostic.error_type, "Syntax Error");
        assert_eq!(diagnostic.error_type, GENERIC_ERROR_TYPE);
    }

    #[test]
    fn test_legacy_syntax_error() {
        let diagnostic = classify("\nmismatched input 'SELEC' expecting {'(', 'SELECT'}(line 1, pos 0)\n");
        assert_eq!(diagnostic.error_type, "Syntax Error");
        let details = diagnostic.details.unwrap();
        assert_eq!(details.position, Some(1));
        assert_eq!(details.near_token.as_deref(), Some("SELEC"));
    }

    #[test]
    fn test_invalid_typed_literal() {
        let raw = r#"[INVALID_TYPED_LITERAL] The value of the typed literal "DATE" is invalid: '2024-13-01'.; line 1 pos 7"#;
        let diagnostic = classify(raw);
        assert_eq!(diagnostic.error_type, "Invalid Literal");
        let details = diagnostic.details.unwrap();
        assert_eq!(details.literal_type.as_deref(), Some("DATE"));
        assert_eq!(details.literal.as_deref(), Some("2024-13-01"));
        assert_eq!(diagnostic.message, "Invalid DATE literal: '2024-13-01'");
    }

    #[test]
    fn test_generic_analysis_exception() {
        let diagnostic = classify(
            "org.apache.spark.sql.AnalysisException: Cannot up cast amount from string to int.;;\n'Project [...]",
        );
        assert_eq!(diagnostic.error_type, "Analysis Error");
        assert_eq!(diagnostic.message, "Cannot up cast amount from string to int.");
    }

    #[test]
    fn test_generic_query_exception() {
        let diagnostic = classify(
            "org.apache.hive.service.cli.HiveSQLException: Error running query: org.apache.spark.SparkException: Job aborted.\n\tat org.apache.spark.sql.hive.thriftserver.SparkExecuteStatementOperation.execute(SparkExecuteStatementOperation.scala:48)",
        );
        assert_eq!(diagnostic.error_type, "Query Error");
        assert!(diagnostic.message.contains("Job aborted"));
    }
}
