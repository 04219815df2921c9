//! Identifier quoting and table-name resolution.
//!
//! `Schema` is created lazily by a connection once its driver is known, and is
//! the source of the connection's `QueryBuilder`. Quoting rules differ per
//! driver: MySQL uses backticks, PostgreSQL and SQLite use double quotes.

use crate::models::DatabaseType;
use std::sync::Arc;

/// Driver-aware identifier helper.
#[derive(Debug)]
pub struct Schema {
    db_type: DatabaseType,
    table_prefix: String,
}

impl Schema {
    pub fn new(db_type: DatabaseType, table_prefix: impl Into<String>) -> Self {
        Self {
            db_type,
            table_prefix: table_prefix.into(),
        }
    }

    pub fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    /// Quote a single identifier part. Already-quoted names are kept.
    pub fn quote_simple_name(&self, name: &str) -> String {
        let (open, close) = self.quote_chars();
        if name == "*" || (name.starts_with(open) && name.ends_with(close) && name.len() > 1) {
            return name.to_string();
        }
        let escaped = name.replace(close, &format!("{close}{close}"));
        format!("{open}{escaped}{close}")
    }

    /// Quote a possibly schema-qualified table name (`schema.table`).
    pub fn quote_table_name(&self, name: &str) -> String {
        let name = self.raw_table_name(name);
        if name.contains('(') || name.contains("{{") {
            return name;
        }
        name.split('.')
            .map(|part| self.quote_simple_name(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Quote a possibly table-qualified column name (`table.column`).
    pub fn quote_column_name(&self, name: &str) -> String {
        if name.contains('(') || name.contains("[[") {
            return name.to_string();
        }
        match name.rsplit_once('.') {
            Some((table, column)) => format!(
                "{}.{}",
                self.quote_table_name(table),
                self.quote_simple_name(column)
            ),
            None => self.quote_simple_name(name),
        }
    }

    /// Quote a sequence name for `last_insert_id`.
    pub fn quote_sequence_name(&self, name: &str) -> String {
        self.quote_table_name(name)
    }

    /// Expand `{{%name}}` placeholders with the table prefix.
    pub fn raw_table_name(&self, name: &str) -> String {
        match name
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
        {
            Some(inner) => inner.replace('%', &self.table_prefix),
            None => name.to_string(),
        }
    }

    /// Create a query builder bound to this schema.
    pub fn create_query_builder(self: &Arc<Self>) -> QueryBuilder {
        QueryBuilder {
            schema: Arc::clone(self),
        }
    }

    fn quote_chars(&self) -> (char, char) {
        match self.db_type {
            DatabaseType::MySQL => ('`', '`'),
            DatabaseType::PostgreSQL | DatabaseType::SQLite => ('"', '"'),
        }
    }
}

/// Builds simple statements with properly quoted identifiers.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    schema: Arc<Schema>,
}

impl QueryBuilder {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// `SELECT <columns> FROM <table>`; an empty column list selects `*`.
    pub fn build_select(&self, table: &str, columns: &[&str]) -> String {
        let columns = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.schema.quote_column_name(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "SELECT {} FROM {}",
            columns,
            self.schema.quote_table_name(table)
        )
    }

    pub fn build_count(&self, table: &str) -> String {
        format!(
            "SELECT COUNT(*) FROM {}",
            self.schema.quote_table_name(table)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_per_driver() {
        let mysql = Schema::new(DatabaseType::MySQL, "");
        let pg = Schema::new(DatabaseType::PostgreSQL, "");
        assert_eq!(mysql.quote_table_name("user"), "`user`");
        assert_eq!(pg.quote_table_name("public.user"), "\"public\".\"user\"");
        assert_eq!(pg.quote_column_name("u.name"), "\"u\".\"name\"");
    }

    #[test]
    fn test_quote_escapes_and_keeps_quoted() {
        let mysql = Schema::new(DatabaseType::MySQL, "");
        assert_eq!(mysql.quote_simple_name("we`ird"), "`we``ird`");
        assert_eq!(mysql.quote_simple_name("`done`"), "`done`");
        assert_eq!(mysql.quote_simple_name("*"), "*");
    }

    #[test]
    fn test_prefix_expansion() {
        let schema = Schema::new(DatabaseType::SQLite, "tbl_");
        assert_eq!(schema.raw_table_name("{{%user}}"), "tbl_user");
        assert_eq!(schema.quote_table_name("{{%user}}"), "\"tbl_user\"");
        assert_eq!(schema.raw_table_name("plain"), "plain");
    }

    #[test]
    fn test_query_builder() {
        let schema = Arc::new(Schema::new(DatabaseType::MySQL, "app_"));
        let builder = schema.create_query_builder();
        assert_eq!(
            builder.build_select("{{%user}}", &["id", "name"]),
            "SELECT `id`, `name` FROM `app_user`"
        );
        assert_eq!(builder.build_select("t", &[]), "SELECT * FROM `t`");
        assert_eq!(builder.build_count("t"), "SELECT COUNT(*) FROM `t`");
        assert!(Arc::ptr_eq(builder.schema(), &schema));
    }
}
