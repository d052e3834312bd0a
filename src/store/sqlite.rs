//! SQLite-backed catalog store.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool while
//! holding the connection lock. Each bulk write is one transaction.

use rusqlite::{params, CachedStatement, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{BulkWriteResult, CatalogStore, StoreError, StoreResult, WriteOp};
use crate::entity::{format_timestamp, parse_timestamp, Entity, Price, Timestamp};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id          TEXT PRIMARY KEY NOT NULL,
    label       TEXT NOT NULL,
    price_cents INTEGER NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    deleted_at  TEXT
);
"#;

const SELECT_COLUMNS: &str = "id, label, price_cents, created_at, updated_at, deleted_at";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the catalog database at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "catalog database opened");
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database (used in tests).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await?
    }
}

impl CatalogStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn reset(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS products;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    async fn insert_many(&self, entities: Vec<Entity>) -> StoreResult<u64> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO products (id, label, price_cents, created_at, updated_at, deleted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for entity in &entities {
                    execute_entity(&mut stmt, entity).map_err(|e| match e {
                        StoreError::Sqlite(e)
                            if e.sqlite_error_code()
                                == Some(rusqlite::ErrorCode::ConstraintViolation) =>
                        {
                            StoreError::DuplicateId(entity.id.clone())
                        }
                        other => other,
                    })?;
                    inserted += 1;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn bulk_write(&self, ops: &[WriteOp]) -> StoreResult<BulkWriteResult> {
        let ops = ops.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut result = BulkWriteResult::default();
            {
                let mut select = tx.prepare_cached(&format!(
                    "SELECT {SELECT_COLUMNS} FROM products WHERE id = ?1"
                ))?;
                let mut insert = tx.prepare_cached(
                    "INSERT INTO products (id, label, price_cents, created_at, updated_at, deleted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                let mut update = tx.prepare_cached(
                    "UPDATE products
                     SET label = ?2, price_cents = ?3, created_at = ?4, updated_at = ?5, deleted_at = ?6
                     WHERE id = ?1",
                )?;
                let mut delete = tx.prepare_cached("DELETE FROM products WHERE id = ?1")?;

                for op in &ops {
                    match op {
                        WriteOp::Upsert(entity) => {
                            let existing = select
                                .query_row(params![entity.id], read_raw)
                                .optional()?;
                            match existing {
                                Some(raw) => {
                                    result.matched += 1;
                                    if raw.into_entity()? != *entity {
                                        execute_entity(&mut update, entity)?;
                                        result.modified += 1;
                                    }
                                }
                                None => {
                                    execute_entity(&mut insert, entity)?;
                                    result.upserted += 1;
                                }
                            }
                        }
                        WriteOp::Delete { id } => {
                            result.deleted += delete.execute(params![id])? as u64;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn list_ids(&self) -> StoreResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM products ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn find(&self, id: &str) -> StoreResult<Option<Entity>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM products WHERE id = ?1"),
                    params![id],
                    read_raw,
                )
                .optional()?;
            raw.map(RawRow::into_entity).transpose()
        })
        .await
    }
}

fn execute_entity(stmt: &mut CachedStatement<'_>, entity: &Entity) -> StoreResult<usize> {
    let cents = entity.price.cents();
    let price_cents = i64::try_from(cents).map_err(|_| StoreError::PriceOutOfRange {
        id: entity.id.clone(),
        cents,
    })?;
    let written = stmt.execute(params![
        entity.id,
        entity.label,
        price_cents,
        format_timestamp(&entity.created_at),
        format_timestamp(&entity.updated_at),
        entity.deleted_at.as_ref().map(format_timestamp),
    ])?;
    Ok(written)
}

/// Row as stored, before timestamp parsing.
struct RawRow {
    id: String,
    label: String,
    price_cents: i64,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        label: row.get(1)?,
        price_cents: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        deleted_at: row.get(5)?,
    })
}

impl RawRow {
    fn into_entity(self) -> StoreResult<Entity> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let ts = |text: &str| -> StoreResult<Timestamp> {
            parse_timestamp(text).map_err(|e| corrupt(format!("timestamp {text:?}: {e}")))
        };
        let price_cents = u64::try_from(self.price_cents)
            .map_err(|_| corrupt(format!("negative price {}", self.price_cents)))?;

        Ok(Entity {
            id: self.id.clone(),
            label: self.label.clone(),
            price: Price::from_cents(price_cents),
            created_at: ts(&self.created_at)?,
            updated_at: ts(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(ts).transpose()?,
        })
    }
}
