//! Schema-prefix awareness for multi-tenant databases.
//!
//! A tenant prefix `acme` maps the logical schemas onto `acme_logbook`,
//! `acme_scm`, … with `public` as the fallback sink. Connections acquired
//! through [`connect_pool`] carry the matching `search_path`, so every
//! query in the store can use unqualified table names.

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use super::{StoreError, StoreResult};

const BASE_SCHEMAS: [&str; 5] = ["logbook", "scm", "identity", "analysis", "governance"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaContext {
    prefix: Option<String>,
}

impl SchemaContext {
    /// Build a context; the prefix must be a valid schema identifier
    /// fragment (lowercase alphanumerics and underscores).
    pub fn new(prefix: Option<String>) -> StoreResult<Self> {
        if let Some(prefix) = &prefix {
            let valid = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !valid {
                return Err(StoreError::SchemaMismatch(format!(
                    "invalid schema prefix `{prefix}`"
                )));
            }
        }
        Ok(SchemaContext { prefix })
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// The concrete schema name for a logical base schema.
    pub fn schema(&self, base: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}_{base}"),
            None => base.to_string(),
        }
    }

    /// The full `search_path`, ending in `public` as the fallback sink.
    pub fn search_path(&self) -> String {
        let mut parts: Vec<String> = BASE_SCHEMAS.iter().map(|b| self.schema(b)).collect();
        parts.push("public".to_string());
        parts.join(", ")
    }
}

/// Open a pool whose connections all carry this context's `search_path`.
pub async fn connect_pool(
    dsn: &str,
    context: &SchemaContext,
    max_connections: u32,
) -> StoreResult<PgPool> {
    let search_path = context.search_path();
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(move |conn, _meta| {
            let stmt = format!("SET search_path TO {search_path}");
            Box::pin(async move {
                conn.execute(stmt.as_str()).await?;
                Ok(())
            })
        })
        .connect(dsn)
        .await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_uses_bare_schemas() {
        let ctx = SchemaContext::default();
        assert_eq!(ctx.schema("scm"), "scm");
        assert_eq!(
            ctx.search_path(),
            "logbook, scm, identity, analysis, governance, public"
        );
    }

    #[test]
    fn prefixed_context_prefixes_every_schema() {
        let ctx = SchemaContext::new(Some("acme".to_string())).unwrap();
        assert_eq!(ctx.schema("logbook"), "acme_logbook");
        assert_eq!(
            ctx.search_path(),
            "acme_logbook, acme_scm, acme_identity, acme_analysis, acme_governance, public"
        );
    }

    #[test]
    fn invalid_prefixes_are_rejected() {
        assert!(SchemaContext::new(Some("".to_string())).is_err());
        assert!(SchemaContext::new(Some("Acme".to_string())).is_err());
        assert!(SchemaContext::new(Some("a;drop".to_string())).is_err());
        assert!(SchemaContext::new(Some("a-b".to_string())).is_err());
    }
}
