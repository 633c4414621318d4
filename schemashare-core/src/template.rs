//! `{{tables.NAME}}` and `{{schema}}` template resolution.
//!
//! Resolution is purely textual: placeholders inside string literals or
//! comments are replaced like any other text. Anything that does not match
//! a recognized form is left exactly as written, so a malformed placeholder
//! reaches the database and fails there as an ordinary syntax error.

use std::fmt;
use std::sync::LazyLock;

use regex_lite::{Captures, NoExpand, Regex};

use crate::db::quote_ident;

static TABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{tables\.([A-Za-z0-9_]+)\}\}").unwrap());
static SCHEMA_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{schema\}\}").unwrap());

/// The namespace a piece of SQL is resolved against.
///
/// Immutable once built; bind a different schema by building a new context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SchemaContext {
    schema: Option<String>,
}

impl SchemaContext {
    /// Context bound to `schema`. An empty name means no isolation.
    pub fn new(schema: Option<&str>) -> Self {
        Self {
            schema: schema.filter(|s| !s.is_empty()).map(str::to_string),
        }
    }

    /// Context for `schema`.
    pub fn with_schema(schema: &str) -> Self {
        Self::new(Some(schema))
    }

    /// Context without a schema: tables resolve unqualified.
    pub fn unscoped() -> Self {
        Self::default()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Qualified reference to `table` in this context.
    pub fn qualify(&self, table: &str) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
            None => table.to_string(),
        }
    }
}

impl fmt::Display for SchemaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}", schema),
            None => write!(f, "(default)"),
        }
    }
}

/// Resolve every template placeholder in `sql` against `ctx`.
///
/// - `{{tables.NAME}}` becomes `"schema"."NAME"`, or bare `NAME` without a schema.
/// - `{{schema}}` becomes the raw schema name, or the empty string.
pub fn resolve(sql: &str, ctx: &SchemaContext) -> String {
    let tables = TABLE_RE.replace_all(sql, |caps: &Captures<'_>| ctx.qualify(&caps[1]));
    SCHEMA_RE
        .replace_all(&tables, NoExpand(ctx.schema().unwrap_or("")))
        .into_owned()
}

/// Whether `sql` contains any recognized placeholder.
pub fn has_placeholders(sql: &str) -> bool {
    TABLE_RE.is_match(sql) || SCHEMA_RE.is_match(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_table_with_schema() {
        let ctx = SchemaContext::with_schema("users_svc");
        let sql = resolve("SELECT * FROM {{tables.accounts}}", &ctx);
        assert_eq!(sql, r#"SELECT * FROM "users_svc"."accounts""#);
        assert!(!sql.contains("{{"));
        assert!(!sql.contains("}}"));
    }

    #[test]
    fn test_resolve_table_without_schema() {
        let ctx = SchemaContext::unscoped();
        assert_eq!(resolve("SELECT * FROM {{tables.accounts}}", &ctx), "SELECT * FROM accounts");
    }

    #[test]
    fn test_empty_schema_name_means_unscoped() {
        assert_eq!(SchemaContext::new(Some("")), SchemaContext::unscoped());
    }

    #[test]
    fn test_resolve_legacy_schema_placeholder() {
        let ctx = SchemaContext::with_schema("orders");
        assert_eq!(resolve("SELECT * FROM {{schema}}.items", &ctx), "SELECT * FROM orders.items");

        let ctx = SchemaContext::unscoped();
        assert_eq!(resolve("SELECT * FROM {{schema}}.items", &ctx), "SELECT * FROM .items");
    }

    #[test]
    fn test_resolve_multiple_placeholders_share_context() {
        let ctx = SchemaContext::with_schema("s1");
        let sql = "INSERT INTO {{tables.a}} SELECT * FROM {{tables.b}} JOIN {{schema}}.c USING (id)";
        assert_eq!(
            resolve(sql, &ctx),
            r#"INSERT INTO "s1"."a" SELECT * FROM "s1"."b" JOIN s1.c USING (id)"#
        );
    }

    #[test]
    fn test_resolve_same_text_against_different_contexts() {
        let sql = "CREATE TABLE {{tables.events}} (id INT)";
        let a = resolve(sql, &SchemaContext::with_schema("tenant_a"));
        let b = resolve(sql, &SchemaContext::with_schema("tenant_b"));
        assert!(a.contains("tenant_a") && !a.contains("tenant_b"));
        assert!(b.contains("tenant_b") && !b.contains("tenant_a"));
        assert_eq!(sql, "CREATE TABLE {{tables.events}} (id INT)");
    }

    #[test]
    fn test_malformed_placeholders_left_verbatim() {
        let ctx = SchemaContext::with_schema("s");
        for sql in [
            "SELECT * FROM {{tables.}}",
            "SELECT * FROM {{tables.bad-name}}",
            "SELECT * FROM {{ tables.users }}",
            "SELECT * FROM {{Tables.users}}",
            "SELECT * FROM {{SCHEMA}}.users",
            "SELECT * FROM {{tables.users}",
        ] {
            assert_eq!(resolve(sql, &ctx), sql);
        }
    }

    #[test]
    fn test_placeholders_inside_string_literals_are_replaced() {
        let ctx = SchemaContext::with_schema("s");
        assert_eq!(
            resolve("SELECT '{{tables.users}}'", &ctx),
            r#"SELECT '"s"."users"'"#
        );
    }

    #[test]
    fn test_schema_name_with_quote_is_escaped() {
        let ctx = SchemaContext::with_schema(r#"we"ird"#);
        assert_eq!(resolve("{{tables.t}}", &ctx), r#""we""ird"."t""#);
    }

    #[test]
    fn test_resolved_text_has_nothing_left_to_resolve() {
        let ctx = SchemaContext::with_schema("s");
        let once = resolve("SELECT * FROM {{tables.users}}", &ctx);
        assert!(!has_placeholders(&once));
        assert_eq!(resolve(&once, &SchemaContext::with_schema("other")), once);
    }

    #[test]
    fn test_no_placeholders() {
        let ctx = SchemaContext::with_schema("s");
        assert_eq!(resolve("SELECT 1;", &ctx), "SELECT 1;");
        assert!(!has_placeholders("SELECT 1;"));
    }
}
