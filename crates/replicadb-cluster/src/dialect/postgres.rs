use std::sync::OnceLock;

use regex::Regex;

use super::standard::{insert_table, mentions, next_value_for, select_for_update};
use super::Dialect;
use crate::metadata::ColumnProperties;

/// PostgreSQL: `nextval('seq')` sequence calls and `serial` columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

fn sequence_function(sql: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        match Regex::new(r"(?i)\b(?:NEXTVAL|CURRVAL|SETVAL)\s*\(\s*'([^']+)'") {
            Ok(re) => re,
            Err(e) => panic!("invalid built-in dialect pattern: {e}"),
        }
    });
    re.captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_matches('"').to_string())
}

impl Dialect for PostgresDialect {
    fn supports_sequences(&self) -> bool {
        true
    }

    fn parse_sequence(&self, sql: &str) -> Option<String> {
        sequence_function(sql).or_else(|| next_value_for(sql))
    }

    fn supports_identity_columns(&self) -> bool {
        true
    }

    fn parse_insert_table(&self, sql: &str) -> Option<String> {
        insert_table(sql)
    }

    fn is_identity(&self, column: &ColumnProperties) -> bool {
        let type_name = column.type_name.to_ascii_lowercase();
        matches!(type_name.as_str(), "serial" | "bigserial" | "smallserial")
            || column
                .default_value
                .as_deref()
                .is_some_and(|d| d.trim_start().to_ascii_lowercase().starts_with("nextval("))
            || mentions(column.default_value.as_deref(), "identity")
    }

    fn supports_select_for_update(&self) -> bool {
        true
    }

    fn is_select_for_update(&self, sql: &str) -> bool {
        select_for_update(sql)
    }
}
