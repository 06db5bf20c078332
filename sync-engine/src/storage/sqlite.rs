use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    from_millis, to_millis, EntityFilter, EntityRecord, MutationState, NewMutation, PendingMutation,
    Storage,
};
use crate::entity::{EntityType, MutationAction};
use crate::error::Result;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    local_revision INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_entities_owner ON entities(entity_type, owner_id);

CREATE TABLE IF NOT EXISTS mutation_log (
    sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    state TEXT NOT NULL DEFAULT 'pending'
);

CREATE INDEX IF NOT EXISTS idx_mutation_log_entity ON mutation_log(entity_type, entity_id);

PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

const MUTATION_COLUMNS: &str =
    "sequence_id, entity_type, entity_id, action, payload, created_at, attempts, last_error, state";

pub struct SqliteStorage {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteStorage {
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch(INIT_SQL)?;
        Ok(Self { conn, in_transaction: false })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn read_entity(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
    let entity_type: String = row.get(0)?;
    let payload: String = row.get(3)?;
    Ok(EntityRecord {
        entity_type: entity_type.parse().map_err(|e| conversion_error(0, e))?,
        entity_id: row.get(1)?,
        owner_id: row.get(2)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(3, e))?,
        synced: row.get::<_, i32>(4)? != 0,
        local_revision: row.get(5)?,
        updated_at: from_millis(row.get(6)?),
    })
}

fn read_mutation(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingMutation> {
    let entity_type: String = row.get(1)?;
    let action: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let state: String = row.get(8)?;
    Ok(PendingMutation {
        sequence_id: row.get(0)?,
        entity_type: entity_type.parse().map_err(|e| conversion_error(1, e))?,
        entity_id: row.get(2)?,
        action: action.parse::<MutationAction>().map_err(|e| conversion_error(3, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(4, e))?,
        created_at: from_millis(row.get(5)?),
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        state: MutationState::parse(&state),
    })
}

impl Storage for SqliteStorage {
    fn get_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntityRecord>> {
        let result = self.conn.query_row(
            "SELECT entity_type, entity_id, owner_id, payload, synced, local_revision, updated_at
             FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type.as_str(), entity_id],
            read_entity,
        ).optional()?;
        Ok(result)
    }

    fn put_entity(&mut self, record: &EntityRecord) -> Result<()> {
        let payload = serde_json::to_string(&record.payload)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO entities
             (entity_type, entity_id, owner_id, payload, synced, local_revision, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.entity_type.as_str(),
                record.entity_id,
                record.owner_id,
                payload,
                record.synced as i32,
                record.local_revision,
                to_millis(&record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn delete_entity(&mut self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM entities WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity_type.as_str(), entity_id],
        )?;
        Ok(removed > 0)
    }

    fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<EntityRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, entity_id, owner_id, payload, synced, local_revision, updated_at
             FROM entities
             WHERE (?1 IS NULL OR entity_type = ?1)
               AND (?2 IS NULL OR owner_id = ?2)
               AND (?3 = 0 OR synced = 0)
             ORDER BY entity_type, entity_id"
        )?;
        let rows = stmt.query_map(
            params![
                filter.entity_type.map(|t| t.as_str()),
                filter.owner_id,
                filter.unsynced_only as i32,
            ],
            read_entity,
        )?.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn append_mutation(&mut self, mutation: &NewMutation) -> Result<u64> {
        let payload = serde_json::to_string(&mutation.payload)?;
        self.conn.execute(
            "INSERT INTO mutation_log (entity_type, entity_id, action, payload, created_at, attempts, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 'pending')",
            params![
                mutation.entity_type.as_str(),
                mutation.entity_id,
                mutation.action.as_str(),
                payload,
                to_millis(&mutation.created_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    fn get_mutation(&self, sequence_id: u64) -> Result<Option<PendingMutation>> {
        let sql = format!("SELECT {} FROM mutation_log WHERE sequence_id = ?1", MUTATION_COLUMNS);
        let result = self.conn.query_row(&sql, params![sequence_id], read_mutation).optional()?;
        Ok(result)
    }

    fn update_mutation(&mut self, mutation: &PendingMutation) -> Result<()> {
        let payload = serde_json::to_string(&mutation.payload)?;
        self.conn.execute(
            "UPDATE mutation_log
             SET entity_id = ?2, payload = ?3, attempts = ?4, last_error = ?5, state = ?6
             WHERE sequence_id = ?1",
            params![
                mutation.sequence_id,
                mutation.entity_id,
                payload,
                mutation.attempts,
                mutation.last_error,
                mutation.state.as_str(),
            ],
        )?;
        Ok(())
    }

    fn remove_mutation(&mut self, sequence_id: u64) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM mutation_log WHERE sequence_id = ?1",
            params![sequence_id],
        )?;
        Ok(removed > 0)
    }

    fn mutations(&self) -> Result<Vec<PendingMutation>> {
        let sql = format!("SELECT {} FROM mutation_log ORDER BY sequence_id ASC", MUTATION_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_mutation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn mutations_for_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<PendingMutation>> {
        let sql = format!(
            "SELECT {} FROM mutation_log WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY sequence_id ASC",
            MUTATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![entity_type.as_str(), entity_id], read_mutation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if !self.in_transaction {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
            self.in_transaction = true;
        }
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("COMMIT")?;
            self.in_transaction = false;
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            self.conn.execute_batch("ROLLBACK")?;
            self.in_transaction = false;
        }
        Ok(())
    }
}
