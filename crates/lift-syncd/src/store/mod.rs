mod queue;

pub use queue::{NewMutation, QueuedMutation};

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use lift_core::models::now_millis;
use lift_core::{resolve, EntityKind, Resolution, SyncRecord};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use serde_json::{Map, Value};
use std::path::Path;

pub type StoreResult<T> = Result<T, StoreError>;

/// Whether an upsert created a new row or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
}

/// Filter for [`LocalStore::get_all`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub parent_id: Option<String>,
    pub unsynced_only: bool,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn unsynced() -> Self {
        Self {
            unsynced_only: true,
            ..Self::default()
        }
    }

    pub fn owned_by(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            ..Self::default()
        }
    }
}

/// Durable local cache: one table per entity kind, the mutation queue, the
/// local-to-server id aliases and the per-kind pull checkpoints.
///
/// Every public operation is a single statement or a single transaction, so
/// no caller ever observes a half-applied write.
#[derive(Clone)]
pub struct LocalStore {
    pool: Pool<SqliteConnectionManager>,
}

impl LocalStore {
    /// Open (or create) the database at `path` and initialize tables if needed
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
        });
        let pool = Pool::new(manager)?;
        let store = Self { pool };
        store.init()?;
        tracing::debug!("local store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database; a single pooled connection keeps every
    /// caller on the same data.
    pub fn open_in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        let store = Self { pool };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(StoreError::from)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        for kind in EntityKind::ALL {
            let table = kind.table();
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    parent_id TEXT,
                    data TEXT NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_parent ON {table}(parent_id);
                CREATE INDEX IF NOT EXISTS idx_{table}_synced ON {table}(synced);"
            ))?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mutation_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                method TEXT NOT NULL,
                resource TEXT NOT NULL,
                payload TEXT,
                local_id TEXT,
                enqueued_at INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS id_aliases (
                local_id TEXT PRIMARY KEY,
                server_id TEXT NOT NULL,
                kind TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<SyncRecord>> {
        let conn = self.conn()?;
        select_record(&conn, kind, id)
    }

    pub fn get_all(&self, kind: EntityKind, filter: &RecordFilter) -> StoreResult<Vec<SyncRecord>> {
        let conn = self.conn()?;
        let mut sql = format!(
            "SELECT id, parent_id, data, synced, updated_at FROM {} WHERE 1 = 1",
            kind.table()
        );
        if filter.parent_id.is_some() {
            sql.push_str(" AND parent_id = ?1");
        }
        if filter.unsynced_only {
            sql.push_str(" AND synced = 0");
        }
        sql.push_str(" ORDER BY updated_at, id");

        let args: Vec<&str> = filter.parent_id.as_deref().into_iter().collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), read_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(decode(kind, row?)?);
        }
        Ok(out)
    }

    /// Insert a new row; an existing id is [`StoreError::AlreadyExists`].
    pub fn insert(&self, record: &SyncRecord) -> StoreResult<()> {
        let conn = self.conn()?;
        let data = encode_fields(&record.fields)?;
        let result = conn.execute(
            &format!(
                "INSERT INTO {} (id, parent_id, data, synced, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                record.kind.table()
            ),
            params![
                record.id,
                record.parent_id,
                data,
                record.synced,
                record.updated_at.timestamp_millis()
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyExists {
                    kind: record.kind,
                    id: record.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a local edit: merge `partial` into the stored attributes, mark
    /// the row dirty and stamp it with the current time.
    pub fn update(
        &self,
        kind: EntityKind,
        id: &str,
        partial: &Map<String, Value>,
    ) -> StoreResult<SyncRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut record = select_record(&tx, kind, id)?.ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_string(),
        })?;
        record.apply_patch(partial);
        record.synced = false;
        record.updated_at = now_millis();
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(record)
    }

    /// Write a full record, inserting or replacing the row.
    pub fn upsert(&self, record: &SyncRecord) -> StoreResult<Upserted> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existed = row_exists(&tx, record.kind, &record.id)?;
        write_record(&tx, record)?;
        tx.commit()?;
        Ok(if existed {
            Upserted::Updated
        } else {
            Upserted::Inserted
        })
    }

    /// Write a pulled record unless the local copy wins the conflict. The
    /// check and the write share one transaction, so an edit landing in
    /// between cannot be overwritten. Returns `None` when nothing changed.
    pub fn apply_remote(&self, remote: &SyncRecord) -> StoreResult<Option<Upserted>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let local = select_record(&tx, remote.kind, &remote.id)?;
        if resolve(local.as_ref(), Some(remote)) == Resolution::UseLocal {
            tracing::debug!("keeping local {} {}", remote.kind, remote.id);
            return Ok(None);
        }
        if local.as_ref().is_some_and(|l| l.same_content(remote)) {
            return Ok(None);
        }
        write_record(&tx, remote)?;
        tx.commit()?;
        Ok(Some(if local.is_some() {
            Upserted::Updated
        } else {
            Upserted::Inserted
        }))
    }

    /// Delete a row only if it has no unconfirmed edits.
    pub fn delete_synced(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1 AND synced = 1", kind.table()),
            [id],
        )?;
        Ok(changed > 0)
    }

    /// Give up on a refused local edit without the server copy at hand: the
    /// row counts as synced again, so any pulled copy replaces it, and the
    /// next pull of `kind` is a full listing that brings that copy back.
    pub fn discard_edit(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            &format!("UPDATE {} SET synced = 1 WHERE id = ?1", kind.table()),
            [id],
        )?;
        tx.execute(
            "DELETE FROM sync_state WHERE key = ?1",
            [kind.checkpoint_key()],
        )?;
        tx.commit()?;
        Ok(changed > 0)
    }

    /// Mark a record synced, unless it was edited again after `as_of`
    /// (the moment its push was issued).
    pub fn mark_synced(&self, kind: EntityKind, id: &str, as_of: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE {} SET synced = 1 WHERE id = ?1 AND updated_at <= ?2",
                kind.table()
            ),
            params![id, as_of.timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    /// Move a locally keyed record to its server-assigned id in one
    /// transaction: the row itself, every child row pointing at it, and an
    /// alias so queued mutations naming the old id still resolve. The row is
    /// marked synced unless it was edited after `as_of`.
    ///
    /// Re-keying an id that has already been moved is a no-op.
    pub fn rekey(
        &self,
        kind: EntityKind,
        old_id: &str,
        new_id: &str,
        as_of: DateTime<Utc>,
    ) -> StoreResult<()> {
        if old_id == new_id {
            self.mark_synced(kind, old_id, as_of)?;
            return Ok(());
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if !row_exists(&tx, kind, old_id)? {
            if row_exists(&tx, kind, new_id)? || alias_of(&tx, old_id)?.as_deref() == Some(new_id) {
                return Ok(());
            }
            return Err(StoreError::NotFound {
                kind,
                id: old_id.to_string(),
            });
        }

        if row_exists(&tx, kind, new_id)? {
            // The server copy already arrived; it carries the pushed state.
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
                [old_id],
            )?;
        } else {
            tx.execute(
                &format!(
                    "UPDATE {} SET id = ?2, synced = CASE WHEN updated_at <= ?3 THEN 1 ELSE 0 END WHERE id = ?1",
                    kind.table()
                ),
                params![old_id, new_id, as_of.timestamp_millis()],
            )?;
        }

        for child in kind.children() {
            tx.execute(
                &format!("UPDATE {} SET parent_id = ?2 WHERE parent_id = ?1", child.table()),
                params![old_id, new_id],
            )?;
        }

        tx.execute(
            "INSERT INTO id_aliases (local_id, server_id, kind) VALUES (?1, ?2, ?3)
             ON CONFLICT(local_id) DO UPDATE SET server_id = excluded.server_id",
            params![old_id, new_id, kind.as_str()],
        )?;

        tx.commit()?;
        tracing::debug!("re-keyed {kind} {old_id} -> {new_id}");
        Ok(())
    }

    /// Server id a local id was re-keyed to, if any.
    pub fn resolve_alias(&self, local_id: &str) -> StoreResult<Option<String>> {
        let conn = self.conn()?;
        alias_of(&conn, local_id)
    }

    /// Delete a single row. Returns whether it existed.
    pub fn delete(&self, kind: EntityKind, id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(&format!("DELETE FROM {} WHERE id = ?1", kind.table()), [id])?;
        Ok(changed > 0)
    }

    /// Delete a record and everything it owns in one transaction. Queued
    /// creates of deleted local-only records are dropped with them.
    /// Returns every deleted (kind, id), the root first.
    pub fn delete_cascade(&self, kind: EntityKind, id: &str) -> StoreResult<Vec<(EntityKind, String)>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        if !row_exists(&tx, kind, id)? {
            return Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            });
        }

        let mut deleted = Vec::new();
        let mut pending = vec![(kind, id.to_string())];
        while let Some((current_kind, current_id)) = pending.pop() {
            for child in current_kind.children() {
                let mut stmt =
                    tx.prepare(&format!("SELECT id FROM {} WHERE parent_id = ?1", child.table()))?;
                let ids = stmt
                    .query_map([&current_id], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                pending.extend(ids.into_iter().map(|child_id| (child, child_id)));
            }
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", current_kind.table()),
                [&current_id],
            )?;
            tx.execute("DELETE FROM mutation_queue WHERE local_id = ?1", [&current_id])?;
            deleted.push((current_kind, current_id));
        }

        tx.commit()?;
        Ok(deleted)
    }

    /// Number of dirty rows across all entity tables.
    pub fn unsynced_count(&self) -> StoreResult<u64> {
        let conn = self.conn()?;
        let mut total = 0u64;
        for kind in EntityKind::ALL {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE synced = 0", kind.table()),
                [],
                |row| row.get(0),
            )?;
            total += count as u64;
        }
        Ok(total)
    }

    /// Last successful pull for `kind`
    pub fn checkpoint(&self, kind: EntityKind) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                [kind.checkpoint_key()],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            None => Ok(None),
            Some(raw) => DateTime::parse_from_rfc3339(&raw)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|e| StoreError::Corrupt {
                    table: "sync_state",
                    message: format!("bad checkpoint '{raw}': {e}"),
                }),
        }
    }

    pub fn set_checkpoint(&self, kind: EntityKind, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![kind.checkpoint_key(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Forget every checkpoint; the next cycle does full pulls.
    pub fn clear_checkpoints(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_state WHERE key LIKE 'lastSync:%'", [])?;
        Ok(())
    }

    /// Wipe all cached data, the queue and the checkpoints.
    pub fn clear_all(&self) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for kind in EntityKind::ALL {
            tx.execute(&format!("DELETE FROM {}", kind.table()), [])?;
        }
        tx.execute_batch(
            "DELETE FROM mutation_queue; DELETE FROM id_aliases; DELETE FROM sync_state;",
        )?;
        tx.commit()?;
        Ok(())
    }
}

type RawRow = (String, Option<String>, String, bool, i64);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(kind: EntityKind, (id, parent_id, data, synced, updated_at): RawRow) -> StoreResult<SyncRecord> {
    let fields: Map<String, Value> =
        serde_json::from_str(&data).map_err(|e| StoreError::Corrupt {
            table: kind.table(),
            message: format!("record {id}: {e}"),
        })?;
    let updated_at = DateTime::from_timestamp_millis(updated_at).ok_or_else(|| StoreError::Corrupt {
        table: kind.table(),
        message: format!("record {id}: timestamp {updated_at} out of range"),
    })?;
    Ok(SyncRecord {
        kind,
        id,
        parent_id,
        fields,
        synced,
        updated_at,
    })
}

fn encode_fields(fields: &Map<String, Value>) -> StoreResult<String> {
    serde_json::to_string(fields).map_err(|e| StoreError::Corrupt {
        table: "record",
        message: e.to_string(),
    })
}

fn select_record(conn: &Connection, kind: EntityKind, id: &str) -> StoreResult<Option<SyncRecord>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT id, parent_id, data, synced, updated_at FROM {} WHERE id = ?1",
                kind.table()
            ),
            [id],
            read_row,
        )
        .optional()?;
    raw.map(|raw| decode(kind, raw)).transpose()
}

fn row_exists(conn: &Connection, kind: EntityKind, id: &str) -> StoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE id = ?1 LIMIT 1", kind.table()),
            [id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn write_record(tx: &Transaction<'_>, record: &SyncRecord) -> StoreResult<()> {
    let data = encode_fields(&record.fields)?;
    tx.execute(
        &format!(
            "INSERT INTO {} (id, parent_id, data, synced, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                parent_id = excluded.parent_id,
                data = excluded.data,
                synced = excluded.synced,
                updated_at = excluded.updated_at",
            record.kind.table()
        ),
        params![
            record.id,
            record.parent_id,
            data,
            record.synced,
            record.updated_at.timestamp_millis()
        ],
    )?;
    Ok(())
}

fn alias_of(conn: &Connection, local_id: &str) -> StoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT server_id FROM id_aliases WHERE local_id = ?1",
            [local_id],
            |row| row.get(0),
        )
        .optional()?)
}
