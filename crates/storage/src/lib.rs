use std::{
    cmp::Ordering,
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use media::{ObjectStore, StoredMediaObject};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::{
    domain::{DocumentId, Role, UserId},
    protocol::{DocumentRecord, FieldFilter, FilterOp, Query},
};

/// SQLite-backed persistence: users with roles, schemaless document
/// collections, and media objects with custom metadata.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An anonymous in-memory database exists per connection, so the pool
        // must stay at one connection there.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;

        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                username   TEXT NOT NULL UNIQUE,
                role       TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure users table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                doc_id     TEXT NOT NULL,
                fields     TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure documents table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS media_objects (
                bucket          TEXT NOT NULL,
                path            TEXT NOT NULL,
                bytes           BLOB NOT NULL,
                content_type    TEXT,
                custom_metadata TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (bucket, path)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure media_objects table exists")?;

        Ok(())
    }

    pub async fn create_user(&self, username: &str, role: Role) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username, role) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET role=excluded.role
             RETURNING id",
        )
        .bind(username)
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn role_for_user(&self, user_id: UserId) -> Result<Option<Role>> {
        let row = sqlx::query("SELECT role FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| Role::parse(&r.get::<String, _>(0))))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    /// Full-replace upsert: the stored field map becomes exactly `fields`.
    pub async fn put_document(
        &self,
        collection: &str,
        doc_id: Option<DocumentId>,
        fields: &Map<String, Value>,
    ) -> Result<DocumentId> {
        let doc_id = doc_id.unwrap_or_else(DocumentId::generate);
        let serialized = serde_json::to_string(fields)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO documents (collection, doc_id, fields, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(collection, doc_id) DO UPDATE SET
                fields = excluded.fields,
                updated_at = excluded.updated_at",
        )
        .bind(collection)
        .bind(doc_id.as_str())
        .bind(serialized)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(doc_id)
    }

    pub async fn get_document(
        &self,
        collection: &str,
        doc_id: &DocumentId,
    ) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query(
            "SELECT doc_id, fields FROM documents WHERE collection = ? AND doc_id = ?",
        )
        .bind(collection)
        .bind(doc_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_record).transpose()
    }

    pub async fn delete_document(&self, collection: &str, doc_id: &DocumentId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND doc_id = ?")
            .bind(collection)
            .bind(doc_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Runs a collection query. Rows come back in id order; filters, ordering
    /// and the limit are applied over the parsed field maps.
    pub async fn run_query(&self, query: &Query) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query(
            "SELECT doc_id, fields FROM documents WHERE collection = ? ORDER BY doc_id ASC",
        )
        .bind(&query.collection)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .into_iter()
            .map(row_to_record)
            .collect::<Result<Vec<_>>>()?;

        records.retain(|record| matches_filters(&record.fields, &query.filters));

        if let Some(order) = &query.order_by {
            records.sort_by(|a, b| {
                let ordering = order_records(a, b, &order.field);
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some(limit) = query.limit {
            records.truncate(limit as usize);
        }

        Ok(records)
    }

    /// Single-statement overwrite: bytes, content type and metadata land
    /// together, so readers never see one without the others.
    pub async fn put_media_object(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: Option<&str>,
        custom_metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let metadata = serde_json::to_string(custom_metadata)?;
        sqlx::query(
            "INSERT INTO media_objects (bucket, path, bytes, content_type, custom_metadata, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(bucket, path) DO UPDATE SET
                bytes = excluded.bytes,
                content_type = excluded.content_type,
                custom_metadata = excluded.custom_metadata,
                updated_at = excluded.updated_at",
        )
        .bind(bucket)
        .bind(path)
        .bind(bytes)
        .bind(content_type)
        .bind(metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_media_object(
        &self,
        bucket: &str,
        path: &str,
    ) -> Result<Option<StoredMediaObject>> {
        let row = sqlx::query(
            "SELECT bytes, content_type, custom_metadata
             FROM media_objects
             WHERE bucket = ? AND path = ?",
        )
        .bind(bucket)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let custom_metadata: HashMap<String, String> =
                serde_json::from_str(&r.get::<String, _>(2))
                    .context("invalid custom metadata json")?;
            Ok(StoredMediaObject {
                bytes: r.get::<Vec<u8>, _>(0),
                content_type: r.get::<Option<String>, _>(1),
                custom_metadata,
            })
        })
        .transpose()
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<DocumentRecord> {
    let doc_id: String = row.get(0);
    let fields: Map<String, Value> =
        serde_json::from_str(&row.get::<String, _>(1)).context("invalid document fields json")?;
    Ok(DocumentRecord {
        id: DocumentId(doc_id),
        fields,
    })
}

fn matches_filters(fields: &Map<String, Value>, filters: &[FieldFilter]) -> bool {
    filters.iter().all(|filter| {
        // A missing field never matches, whatever the operator.
        let Some(actual) = fields.get(&filter.field) else {
            return false;
        };
        match filter.op {
            FilterOp::Eq => actual == &filter.value,
            FilterOp::Ne => actual != &filter.value,
            FilterOp::Gt => compare_values(actual, &filter.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(actual, &filter.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare_values(actual, &filter.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(actual, &filter.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    })
}

/// Ordering comparisons are defined for number/number and string/string
/// pairs only; anything else is not comparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64()?;
            let b = b.as_f64()?;
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn order_records(a: &DocumentRecord, b: &DocumentRecord, field: &str) -> Ordering {
    let ordering = match (a.fields.get(field), b.fields.get(field)) {
        (Some(a_value), Some(b_value)) => {
            compare_values(a_value, b_value).unwrap_or(Ordering::Equal)
        }
        // Records without the order field sort after those carrying it.
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    ordering.then_with(|| a.id.0.cmp(&b.id.0))
}

#[async_trait]
impl ObjectStore for Storage {
    async fn fetch(&self, bucket: &str, path: &str) -> anyhow::Result<Option<StoredMediaObject>> {
        self.get_media_object(bucket, path).await
    }

    async fn publish(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
        custom_metadata: HashMap<String, String>,
    ) -> anyhow::Result<()> {
        self.put_media_object(
            bucket,
            path,
            &bytes,
            content_type.as_deref(),
            &custom_metadata,
        )
        .await
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
