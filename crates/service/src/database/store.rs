use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use common::store::{matches_prefix, normalize_prefix, Node, PutCondition, Store, StoreError};

use super::Database;

impl Database {
    fn check_open(&self) -> Result<(), StoreError<sqlx::Error>> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

fn decode_node(row: &SqliteRow) -> Result<Node, StoreError<sqlx::Error>> {
    let key: String = row.try_get("key")?;
    let raw: String = row.try_get("value")?;
    let seq: i64 = row.try_get("seq")?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| StoreError::InvalidRecord(key.clone(), e.to_string()))?;
    Ok(Node {
        key,
        value,
        seq: seq as u64,
    })
}

#[async_trait]
impl Store for Database {
    type Error = sqlx::Error;

    async fn get(&self, key: &str) -> Result<Option<Node>, StoreError<Self::Error>> {
        self.check_open()?;
        let row = sqlx::query(
            r#"
            SELECT key, value, seq
            FROM nodes
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&**self)
        .await?;

        row.as_ref().map(decode_node).transpose()
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        condition: PutCondition,
    ) -> Result<bool, StoreError<Self::Error>> {
        self.check_open()?;
        let encoded = serde_json::to_string(&value)
            .map_err(|e| StoreError::InvalidRecord(key.to_string(), e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        // the seq is taken inside the statement so it stays monotonic across writers
        let on_conflict = match condition {
            PutCondition::Always => {
                "DO UPDATE SET value = excluded.value, seq = excluded.seq, updated_at = excluded.updated_at"
            }
            PutCondition::IfAbsent => "DO NOTHING",
            PutCondition::IfChanged => {
                "DO UPDATE SET value = excluded.value, seq = excluded.seq, updated_at = excluded.updated_at \
                 WHERE nodes.value <> excluded.value"
            }
        };
        let sql = format!(
            r#"
            INSERT INTO nodes (key, value, seq, updated_at)
            SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, ? FROM nodes WHERE true
            ON CONFLICT(key) {}
            "#,
            on_conflict
        );

        let result = sqlx::query(&sql)
            .bind(key)
            .bind(&encoded)
            .bind(now)
            .execute(&**self)
            .await?;

        let written = result.rows_affected() > 0;
        if written {
            tracing::trace!(key, "stored node");
        }
        Ok(written)
    }

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<Node>, StoreError<Self::Error>> {
        self.check_open()?;
        let prefix = normalize_prefix(prefix);
        let rows = sqlx::query(
            r#"
            SELECT key, value, seq
            FROM nodes
            WHERE substr(key, 1, ?) = ?
            ORDER BY key
            "#,
        )
        .bind(prefix.chars().count() as i64)
        .bind(&prefix)
        .fetch_all(&**self)
        .await?;

        let mut nodes = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: String = row.try_get("key")?;
            if matches_prefix(&key, &prefix, recursive) {
                nodes.push(decode_node(row)?);
            }
        }
        Ok(nodes)
    }

    async fn close(&self) -> Result<(), StoreError<Self::Error>> {
        if self.mark_closed() {
            tracing::debug!("closing database");
            self.pool.close().await;
        }
        Ok(())
    }
}
