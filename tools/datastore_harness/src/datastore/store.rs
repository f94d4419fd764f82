use crate::datastore::{Entity, Key};
use crate::errors::HarnessError;
use crate::logging::append_run_log;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

type StoreResult<T> = Result<T, HarnessError>;

/// Entities are isolated per application and namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    pub app_id: String,
    pub namespace: String,
}

impl Partition {
    pub fn new(app_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            namespace: namespace.into(),
        }
    }
}

/// Committed entity storage behind the local delegate.
pub trait EntityStore: Send {
    fn backend_name(&self) -> &'static str;
    fn get(&self, partition: &Partition, key: &Key) -> StoreResult<Option<Entity>>;
    fn put(&mut self, partition: &Partition, entity: &Entity) -> StoreResult<()>;
    fn delete(&mut self, partition: &Partition, key: &Key) -> StoreResult<bool>;
    fn scan_kind(&self, partition: &Partition, kind: &str) -> StoreResult<Vec<Entity>>;
    fn clear(&mut self) -> StoreResult<()>;

    /// Apply a committed transaction's mutations.
    fn apply(&mut self, partition: &Partition, puts: &[Entity], deletes: &[Key]) -> StoreResult<()> {
        for entity in puts {
            self.put(partition, entity)?;
        }
        for key in deletes {
            self.delete(partition, key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    partitions: BTreeMap<Partition, BTreeMap<Key, Entity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EntityStore for MemoryEntityStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, partition: &Partition, key: &Key) -> StoreResult<Option<Entity>> {
        Ok(self
            .partitions
            .get(partition)
            .and_then(|entities| entities.get(key))
            .cloned())
    }

    fn put(&mut self, partition: &Partition, entity: &Entity) -> StoreResult<()> {
        self.partitions
            .entry(partition.clone())
            .or_default()
            .insert(entity.key.clone(), entity.clone());
        Ok(())
    }

    fn delete(&mut self, partition: &Partition, key: &Key) -> StoreResult<bool> {
        Ok(self
            .partitions
            .get_mut(partition)
            .map(|entities| entities.remove(key).is_some())
            .unwrap_or(false))
    }

    fn scan_kind(&self, partition: &Partition, kind: &str) -> StoreResult<Vec<Entity>> {
        Ok(self
            .partitions
            .get(partition)
            .map(|entities| {
                entities
                    .values()
                    .filter(|entity| entity.key.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.partitions.clear();
        Ok(())
    }
}

pub struct SqliteEntityStore {
    conn: Connection,
}

impl SqliteEntityStore {
    pub fn open_in_memory() -> StoreResult<Self> {
        let mut conn = Connection::open_in_memory().map_err(db_err)?;
        run_migrations(&mut conn)?;
        Ok(Self { conn })
    }

    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        append_run_log(
            "info",
            "entity_store.sqlite.open",
            json!({ "path": path.display().to_string() }),
        );
        let mut conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        run_migrations(&mut conn)?;
        Ok(Self { conn })
    }
}

impl EntityStore for SqliteEntityStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, partition: &Partition, key: &Key) -> StoreResult<Option<Entity>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM entities WHERE app_id = ?1 AND namespace = ?2 AND entity_key = ?3",
                params![partition.app_id, partition.namespace, key_column(key)?],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        body.map(|text| entity_from_body(&text)).transpose()
    }

    fn put(&mut self, partition: &Partition, entity: &Entity) -> StoreResult<()> {
        upsert_entity(&self.conn, partition, entity)
    }

    fn delete(&mut self, partition: &Partition, key: &Key) -> StoreResult<bool> {
        delete_entity(&self.conn, partition, key)
    }

    fn scan_kind(&self, partition: &Partition, kind: &str) -> StoreResult<Vec<Entity>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT body FROM entities WHERE app_id = ?1 AND namespace = ?2 AND kind = ?3",
            )
            .map_err(db_err)?;
        let bodies = stmt
            .query_map(params![partition.app_id, partition.namespace, kind], |row| {
                row.get::<_, String>(0)
            })
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        bodies.iter().map(|text| entity_from_body(text)).collect()
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM entities", [])
            .map_err(db_err)?;
        Ok(())
    }

    fn apply(&mut self, partition: &Partition, puts: &[Entity], deletes: &[Key]) -> StoreResult<()> {
        let tx = self.conn.transaction().map_err(db_err)?;
        for entity in puts {
            upsert_entity(&tx, partition, entity)?;
        }
        for key in deletes {
            delete_entity(&tx, partition, key)?;
        }
        tx.commit().map_err(db_err)
    }
}

fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../../migrations/0001_entities.sql"))];

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY);",
    )
    .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }
    Ok(())
}

fn upsert_entity(conn: &Connection, partition: &Partition, entity: &Entity) -> StoreResult<()> {
    let body = serde_json::to_string(entity).map_err(|e| HarnessError::Datastore(e.to_string()))?;
    conn.execute(
        "INSERT INTO entities (app_id, namespace, entity_key, kind, body)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(app_id, namespace, entity_key) DO UPDATE SET body = excluded.body",
        params![
            partition.app_id,
            partition.namespace,
            key_column(&entity.key)?,
            entity.key.kind,
            body
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn delete_entity(conn: &Connection, partition: &Partition, key: &Key) -> StoreResult<bool> {
    let removed = conn
        .execute(
            "DELETE FROM entities WHERE app_id = ?1 AND namespace = ?2 AND entity_key = ?3",
            params![partition.app_id, partition.namespace, key_column(key)?],
        )
        .map_err(db_err)?;
    Ok(removed > 0)
}

fn key_column(key: &Key) -> StoreResult<String> {
    serde_json::to_string(key).map_err(|e| HarnessError::Datastore(e.to_string()))
}

fn entity_from_body(text: &str) -> StoreResult<Entity> {
    serde_json::from_str(text)
        .map_err(|e| HarnessError::Datastore(format!("corrupt entity row: {e}")))
}

fn db_err(error: rusqlite::Error) -> HarnessError {
    HarnessError::Datastore(error.to_string())
}
