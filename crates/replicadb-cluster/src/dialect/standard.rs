use std::sync::OnceLock;

use regex::Regex;

use super::{unquote, Dialect};
use crate::metadata::ColumnProperties;

const IDENTIFIER: &str = r#"[\w."`\[\]]+"#;

fn compiled(cell: &'static OnceLock<Regex>, pattern: impl FnOnce() -> String) -> &'static Regex {
    cell.get_or_init(|| match Regex::new(&pattern()) {
        Ok(re) => re,
        Err(e) => panic!("invalid built-in dialect pattern: {e}"),
    })
}

fn capture(re: &Regex, sql: &str) -> Option<String> {
    re.captures(sql)
        .and_then(|c| c.get(1))
        .map(|m| unquote(m.as_str()))
}

/// `NEXT VALUE FOR <sequence>`
pub(super) fn next_value_for(sql: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    capture(
        compiled(&RE, || format!(r"(?i)\bNEXT\s+VALUE\s+FOR\s+({IDENTIFIER})")),
        sql,
    )
}

/// `INSERT [INTO] <table>`
pub(super) fn insert_table(sql: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    capture(
        compiled(&RE, || format!(r"(?i)^\s*INSERT\s+(?:INTO\s+)?({IDENTIFIER})")),
        sql,
    )
}

pub(super) fn select_for_update(sql: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, || r"(?is)^\s*SELECT\b.+\bFOR\s+UPDATE\b".to_string()).is_match(sql)
}

pub(super) fn mentions(value: Option<&str>, needle: &str) -> bool {
    value.is_some_and(|v| v.to_ascii_lowercase().contains(needle))
}

/// ANSI SQL: `NEXT VALUE FOR` sequences and `GENERATED ... AS IDENTITY` columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDialect;

impl Dialect for StandardDialect {
    fn supports_sequences(&self) -> bool {
        true
    }

    fn parse_sequence(&self, sql: &str) -> Option<String> {
        next_value_for(sql)
    }

    fn supports_identity_columns(&self) -> bool {
        true
    }

    fn parse_insert_table(&self, sql: &str) -> Option<String> {
        insert_table(sql)
    }

    fn is_identity(&self, column: &ColumnProperties) -> bool {
        mentions(Some(&column.type_name), "identity")
            || mentions(column.default_value.as_deref(), "identity")
    }

    fn supports_select_for_update(&self) -> bool {
        true
    }

    fn is_select_for_update(&self, sql: &str) -> bool {
        select_for_update(sql)
    }
}
