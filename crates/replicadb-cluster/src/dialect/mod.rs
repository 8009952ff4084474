//! Vendor SQL introspection used by the locking planner and query routing.
//!
//! Dialects are pure: they inspect SQL text and column metadata and never
//! contact a backend.

mod mysql;
mod postgres;
mod standard;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use standard::StandardDialect;

use crate::metadata::ColumnProperties;

pub trait Dialect: Send + Sync {
    fn supports_sequences(&self) -> bool;

    /// Sequence consumed by `sql`, if any.
    fn parse_sequence(&self, sql: &str) -> Option<String>;

    fn supports_identity_columns(&self) -> bool;

    /// Target table of an INSERT statement.
    fn parse_insert_table(&self, sql: &str) -> Option<String>;

    /// Whether the column generates its own values, for columns whose
    /// auto-increment flag is unknown.
    fn is_identity(&self, column: &ColumnProperties) -> bool;

    fn supports_select_for_update(&self) -> bool;

    fn is_select_for_update(&self, sql: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectKind {
    Standard,
    Postgres,
    MySql,
}

impl DialectKind {
    pub fn dialect(self) -> Arc<dyn Dialect> {
        match self {
            DialectKind::Standard => Arc::new(StandardDialect),
            DialectKind::Postgres => Arc::new(PostgresDialect),
            DialectKind::MySql => Arc::new(MySqlDialect),
        }
    }
}

/// Strips identifier quoting: `"Orders"`, `` `orders` ``, `[orders]`.
fn unquote(identifier: &str) -> String {
    identifier
        .split('.')
        .map(|part| part.trim_matches(|c| matches!(c, '"' | '`' | '[' | ']')))
        .collect::<Vec<_>>()
        .join(".")
}
