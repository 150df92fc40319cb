//! Property-based tests for error classification
//!
//! These tests verify that classification:
//! - Never panics and always yields a non-empty, bounded message
//! - Recovers identifiers from the structured Spark messages
//! - Reports 1-based positions for syntax errors

use proptest::prelude::*;
use sqlbridge::classifier::{Classifier, Limits, SparkDialect, SqliteDialect, GENERIC_ERROR_TYPE};

fn spark(max_message_len: usize) -> Classifier {
    Classifier::new(
        Box::new(SparkDialect::new()),
        Limits {
            max_message_len,
            snippet_len: 200,
        },
    )
}

fn arb_identifier() -> impl Strategy<Value = String> {
    "[a-z_][a-z0-9_]{0,20}"
}

fn arb_qualified_name() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(arb_identifier(), 1..=3)
}

proptest! {
    #[test]
    fn classify_never_panics(raw in any::<String>()) {
        let diagnostic = spark(500).classify(&raw);
        prop_assert!(!diagnostic.message.trim().is_empty());
        prop_assert!(!diagnostic.error_type.is_empty());

        let diagnostic = Classifier::new(Box::new(SqliteDialect::new()), Limits::default()).classify(&raw);
        prop_assert!(!diagnostic.message.trim().is_empty());
    }

    #[test]
    fn messages_respect_the_bound(raw in "\\PC{0,2000}", max in 1usize..600) {
        let diagnostic = spark(max).classify(&raw);
        prop_assert!(diagnostic.message.chars().count() <= max);
    }

    #[test]
    fn plain_text_is_generic(words in prop::collection::vec("[a-z]{1,10}", 1..20)) {
        let raw = words.join(" ");
        let diagnostic = spark(500).classify(&raw);
        prop_assert_eq!(diagnostic.error_type, GENERIC_ERROR_TYPE);
        prop_assert_eq!(diagnostic.message, raw);
        prop_assert!(diagnostic.details.is_none());
    }

    #[test]
    fn table_names_are_unquoted(parts in arb_qualified_name()) {
        let quoted = parts.iter().map(|p| format!("`{}`", p)).collect::<Vec<_>>().join(".");
        let raw = format!(
            "[TABLE_OR_VIEW_NOT_FOUND] The table or view {} cannot be found. Verify the spelling and correctness of the schema and catalog.",
            quoted
        );
        let diagnostic = spark(500).classify(&raw);
        prop_assert_eq!(diagnostic.error_type.as_str(), "Table Not Found");
        let details = diagnostic.details.unwrap();
        prop_assert_eq!(details.table_name, Some(parts.join(".")));
    }

    #[test]
    fn syntax_positions_are_one_based(token in arb_identifier(), line in 1u32..500, pos in 0u32..500) {
        let raw = format!(
            "[PARSE_SYNTAX_ERROR] Syntax error at or near '{}'.(line {}, pos {})",
            token, line, pos
        );
        let diagnostic = spark(500).classify(&raw);
        prop_assert_eq!(diagnostic.error_type.as_str(), "Syntax Error");
        let details = diagnostic.details.unwrap();
        prop_assert_eq!(details.line, Some(line));
        prop_assert_eq!(details.position, Some(pos + 1));
        prop_assert_eq!(details.near_token, Some(token));
    }
}
