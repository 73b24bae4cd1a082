// Postgres persistence: one JSONB table keyed by (collection, id).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::query::{Direction, Filter, FilterOp, Query};
use crate::store::{stamp_created, stamp_updated, ApplyFn, DocumentStore};

/// Columns mirrored out of the JSON body. Range filters and ordering on these
/// use the typed column instead of JSONB string comparison.
const TIMESTAMP_COLUMNS: &[&str] = &["created_at", "updated_at"];

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query_scalar::<_, Value>(
            "SELECT data FROM documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Value>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query_as::<_, (String, Value)>(
            "SELECT id, data FROM documents WHERE collection = $1 AND id = ANY($2)",
        )
        .bind(collection)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        // Preserve caller order.
        let mut by_id: std::collections::HashMap<String, Value> = rows.into_iter().collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Value>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT data FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        for filter in &query.filters {
            qb.push(" AND ");
            push_filter(&mut qb, filter);
        }

        qb.push(" ORDER BY ");
        for order in &query.order_by {
            push_field(&mut qb, &order.field);
            qb.push(match order.direction {
                Direction::Asc => " ASC NULLS FIRST, ",
                Direction::Desc => " DESC NULLS LAST, ",
            });
        }
        qb.push("created_at ASC, id ASC");

        if let Some(limit) = query.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }
        if query.offset > 0 {
            qb.push(" OFFSET ");
            qb.push_bind(query.offset as i64);
        }

        let rows = qb.build_query_scalar::<Value>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64> {
        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT count(*) FROM documents WHERE collection = ");
        qb.push_bind(collection.to_string());
        for filter in filters {
            qb.push(" AND ");
            push_filter(&mut qb, filter);
        }
        let n = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    async fn create(&self, collection: &str, id: Option<&str>, mut data: Value) -> Result<Value> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        stamp_created(&mut data, &id, &now)?;

        let inserted = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO documents (collection, id, data, version, created_at, updated_at)
            VALUES ($1, $2, $3, 1, $4, $4)
            ON CONFLICT (collection, id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(&data)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(data),
            None => Err(StoreError::already_exists(collection, &id)),
        }
    }

    async fn update_with(
        &self,
        collection: &str,
        id: &str,
        apply: &mut ApplyFn<'_>,
    ) -> Result<Value> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent writers on the same document.
        let current = sqlx::query_scalar::<_, Value>(
            "SELECT data FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found(collection, id))?;

        let mut next = current.clone();
        if let Err(e) = apply(&mut next) {
            tx.rollback().await?;
            return Err(e);
        }
        let now: DateTime<Utc> = Utc::now();
        stamp_updated(&mut next, &current, &now)?;

        sqlx::query(
            r#"
            UPDATE documents
            SET data = $3, version = version + 1, updated_at = $4
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(&next)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(collection, id, "Document updated");
        Ok(next)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn path_segments(field: &str) -> Vec<String> {
    field.split('.').map(str::to_string).collect()
}

fn push_field(qb: &mut QueryBuilder<'_, Postgres>, field: &str) {
    if TIMESTAMP_COLUMNS.contains(&field) {
        qb.push(field);
    } else {
        qb.push("(data #> ");
        qb.push_bind(path_segments(field));
        qb.push(")");
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) {
    let is_timestamp = TIMESTAMP_COLUMNS.contains(&filter.field.as_str());
    let range_op = match filter.op {
        FilterOp::Gt => Some(" > "),
        FilterOp::Gte => Some(" >= "),
        FilterOp::Lt => Some(" < "),
        FilterOp::Lte => Some(" <= "),
        _ => None,
    };

    if let (true, Some(op), Some(ts)) = (is_timestamp, range_op, filter.value.as_str()) {
        qb.push(filter.field.as_str());
        qb.push(op);
        qb.push_bind(ts.to_string());
        qb.push("::timestamptz");
        return;
    }

    let path = path_segments(&filter.field);
    match filter.op {
        FilterOp::Eq => {
            qb.push("(data #> ");
            qb.push_bind(path);
            qb.push(") = ");
            qb.push_bind(filter.value.clone());
            qb.push("::jsonb");
        }
        FilterOp::Ne => {
            qb.push("(data #> ");
            qb.push_bind(path);
            qb.push(") IS DISTINCT FROM ");
            qb.push_bind(filter.value.clone());
            qb.push("::jsonb");
        }
        FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte => {
            qb.push("(data #> ");
            qb.push_bind(path);
            qb.push(")");
            qb.push(range_op.unwrap_or(" = "));
            qb.push_bind(filter.value.clone());
            qb.push("::jsonb");
        }
        FilterOp::In => {
            qb.push_bind(filter.value.clone());
            qb.push("::jsonb @> jsonb_build_array(data #> ");
            qb.push_bind(path);
            qb.push(")");
        }
        FilterOp::ArrayContains => {
            qb.push("(data #> ");
            qb.push_bind(path);
            qb.push(") @> jsonb_build_array(");
            qb.push_bind(filter.value.clone());
            qb.push("::jsonb)");
        }
        FilterOp::TextContains => {
            let needle = filter.value.as_str().unwrap_or_default();
            qb.push("(data #>> ");
            qb.push_bind(path);
            qb.push(") ILIKE ");
            qb.push_bind(format!("%{}%", escape_like(needle)));
        }
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
    }

    #[test]
    fn filter_sql_uses_json_paths() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 WHERE ");
        push_filter(&mut qb, &Filter::eq("payload.country", "DE"));
        assert_eq!(qb.sql(), "SELECT 1 WHERE (data #> $1) = $2::jsonb");
    }

    #[test]
    fn timestamp_range_filters_use_columns() {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT 1 WHERE ");
        push_filter(&mut qb, &Filter::gte("created_at", "2026-01-01T00:00:00Z"));
        assert_eq!(qb.sql(), "SELECT 1 WHERE created_at >= $1::timestamptz");
    }
}
