//! SQLite error wording, used when the local SQLite backend is in play.

use super::{unquote_identifier, DiagnosticDialect, ErrorDetails, Extracted, Limits, Rule};
use regex::{Captures, Regex};

pub struct SqliteDialect {
    rules: Vec<Rule>,
}

impl Default for SqliteDialect {
    fn default() -> Self {
        SqliteDialect::new()
    }
}

impl SqliteDialect {
    pub fn new() -> Self {
        let rules = vec![
            Rule {
                name: "no_such_table",
                error_type: "Table Not Found",
                pattern: Regex::new(r"no such table:\s*(?P<name>\S+)").expect("valid regex"),
                extract: extract_table,
            },
            Rule {
                name: "no_such_column",
                error_type: "Column Not Found",
                pattern: Regex::new(r"no such column:\s*(?P<name>\S+)").expect("valid regex"),
                extract: extract_column,
            },
            Rule {
                name: "syntax_error",
                error_type: "Syntax Error",
                pattern: Regex::new(r#"near "(?P<token>[^"]*)": syntax error"#).expect("valid regex"),
                extract: extract_syntax,
            },
            Rule {
                name: "incomplete_input",
                error_type: "Syntax Error",
                pattern: Regex::new(r"incomplete input").expect("valid regex"),
                extract: |_, _, _| {
                    Some(Extracted {
                        message: "Syntax error: statement is incomplete".to_string(),
                        details: ErrorDetails::default(),
                    })
                },
            },
        ];
        SqliteDialect { rules }
    }
}

impl DiagnosticDialect for SqliteDialect {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

fn extract_table(caps: &Captures<'_>, _raw: &str, _limits: &Limits) -> Option<Extracted> {
    let name = unquote_identifier(caps.name("name")?.as_str());
    Some(Extracted {
        message: format!("Table or view '{}' not found. Check the name and schema.", name),
        details: ErrorDetails {
            table_name: Some(name),
            ..ErrorDetails::default()
        },
    })
}

fn extract_column(caps: &Captures<'_>, _raw: &str, _limits: &Limits) -> Option<Extracted> {
    let name = unquote_identifier(caps.name("name")?.as_str());
    Some(Extracted {
        message: format!("Column '{}' cannot be resolved", name),
        details: ErrorDetails {
            column_name: Some(name),
            ..ErrorDetails::default()
        },
    })
}

fn extract_syntax(caps: &Captures<'_>, _raw: &str, _limits: &Limits) -> Option<Extracted> {
    let token = caps.name("token")?.as_str().to_string();
    Some(Extracted {
        message: format!("Syntax error at or near '{}'", token),
        details: ErrorDetails {
            near_token: Some(token),
            ..ErrorDetails::default()
        },
    })
}
