use super::standard::{insert_table, mentions, select_for_update};
use super::Dialect;
use crate::metadata::ColumnProperties;

/// MySQL: no sequences; `AUTO_INCREMENT` columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn supports_sequences(&self) -> bool {
        false
    }

    fn parse_sequence(&self, _sql: &str) -> Option<String> {
        None
    }

    fn supports_identity_columns(&self) -> bool {
        true
    }

    fn parse_insert_table(&self, sql: &str) -> Option<String> {
        insert_table(sql)
    }

    fn is_identity(&self, column: &ColumnProperties) -> bool {
        mentions(Some(&column.type_name), "auto_increment")
            || mentions(column.default_value.as_deref(), "auto_increment")
    }

    fn supports_select_for_update(&self) -> bool {
        true
    }

    fn is_select_for_update(&self, sql: &str) -> bool {
        select_for_update(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtick_table() {
        let d = MySqlDialect;
        assert_eq!(
            d.parse_insert_table("INSERT INTO `shop`.`orders` (sku) VALUES ('a')"),
            Some("shop.orders".to_string())
        );
        assert!(!d.supports_sequences());
    }

    #[test]
    fn test_auto_increment_column() {
        let d = MySqlDialect;
        assert!(d.is_identity(&ColumnProperties::new("id", "INT AUTO_INCREMENT")));
        assert!(!d.is_identity(&ColumnProperties::new("name", "VARCHAR(20)")));
    }
}
