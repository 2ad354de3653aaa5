use std::sync::{Arc, RwLock};

use rusqlite::{Connection, Params, Transaction};
use rusqlite_migration::{Migrations, M};
use serde::de::DeserializeOwned;

use crate::db::error::{Error, Result};

/// Handle to a review database. Cheap to clone; writers serialize on the
/// underlying connection lock, and every multi-statement operation runs
/// inside a single SQLite transaction via [`Db::transaction`].
#[derive(Clone)]
pub struct Db {
    conn: Arc<RwLock<Connection>>,
}

impl Db {
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let db = Db {
            conn: Arc::new(RwLock::new(conn)),
        };
        db.migrate(&Self::migrations())?;

        Ok(db)
    }

    /// Applies schema migrations. Called on open with the engine's own
    /// schema; callers that keep additional tables alongside it can run
    /// their own migrations through here as well.
    pub fn migrate(&self, migrations: &Migrations) -> Result<()> {
        let mut conn = self.conn.write().map_err(|_| Error::Lock)?;
        migrations.to_latest(&mut *conn)?;
        Ok(())
    }

    fn migrations() -> Migrations<'static> {
        Migrations::new(vec![M::up(
            "
            CREATE TABLE entity (
                entity_type TEXT NOT NULL,
                entity_id   INTEGER NOT NULL,
                version     INTEGER NOT NULL DEFAULT 1,
                data        TEXT NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            );

            CREATE TABLE changegroup (
                id              TEXT NOT NULL PRIMARY KEY,
                source          TEXT NOT NULL,
                label           TEXT,
                description     TEXT,
                job_id          TEXT,
                status          TEXT NOT NULL DEFAULT 'pending',
                changeset_count INTEGER NOT NULL DEFAULT 0,
                approved_count  INTEGER NOT NULL DEFAULT 0,
                rejected_count  INTEGER NOT NULL DEFAULT 0,
                created_by      TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );

            CREATE TABLE changeset (
                id              TEXT NOT NULL PRIMARY KEY,
                changegroup_id  TEXT REFERENCES changegroup(id),
                entity_type     TEXT NOT NULL,
                entity_id       INTEGER,
                operation       TEXT NOT NULL,
                entity_version  INTEGER,
                before_snapshot TEXT,
                after_snapshot  TEXT,
                status          TEXT NOT NULL DEFAULT 'pending',
                created_by      TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                committed_by    TEXT,
                committed_at    INTEGER,
                discarded_at    INTEGER
            );
            CREATE INDEX idx_changeset_changegroup ON changeset(changegroup_id);
            CREATE INDEX idx_changeset_entity ON changeset(entity_type, entity_id);

            CREATE TABLE field_change (
                id           TEXT NOT NULL PRIMARY KEY,
                changeset_id TEXT NOT NULL REFERENCES changeset(id),
                position     INTEGER NOT NULL,
                field_name   TEXT NOT NULL,
                old_value    TEXT,
                new_value    TEXT,
                status       TEXT NOT NULL DEFAULT 'pending',
                approved_by  TEXT,
                approved_at  INTEGER,
                rejected_by  TEXT,
                rejected_at  INTEGER
            );
            CREATE INDEX idx_field_change_changeset ON field_change(changeset_id);
            ",
        )])
    }

    /// Calls the supplied closure with a database transaction. Commits
    /// automatically if the closure returns Ok, otherwise rolls back.
    ///
    /// This is the engine's atomic unit: a commit's read-check-write
    /// sequence and the changeset status flip happen inside one call.
    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&DbTransaction) -> Result<R>,
    {
        let mut conn = self.conn.write().map_err(|_| Error::Lock)?;
        let txn = conn.transaction()?;
        let result = f(&DbTransaction::new(&txn))?;
        txn.commit()?;
        Ok(result)
    }

    /// Shortcut to run a query in its own transaction. Rows are mapped to
    /// `T` by column name via serde_rusqlite.
    pub fn query<T: DeserializeOwned, P: Params>(&self, sql: &str, params: P) -> Result<Vec<T>> {
        self.transaction(|txn| txn.query(sql, params))
    }
}

pub struct DbTransaction<'a> {
    txn: &'a Transaction<'a>,
}

impl<'a> DbTransaction<'a> {
    pub(crate) fn new(txn: &'a Transaction<'a>) -> Self {
        Self { txn }
    }

    pub fn connection(&self) -> &rusqlite::Connection {
        self.txn
    }

    pub fn query<T: DeserializeOwned, P: Params>(&self, sql: &str, params: P) -> Result<Vec<T>> {
        let mut stmt = self.txn.prepare(sql)?;
        let entities = serde_rusqlite::from_rows::<T>(stmt.query(params)?)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::Db;

    #[test]
    fn open_memory() -> anyhow::Result<()> {
        let _ = Db::open_memory()?;
        Ok(())
    }

    #[test]
    fn open_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = Db::open(dir.path().join("review.db"))?;
        // Reopen to confirm migrations are idempotent
        drop(db);
        let _ = Db::open(dir.path().join("review.db"))?;
        Ok(())
    }

    #[test]
    fn transaction_rolls_back_on_error() -> anyhow::Result<()> {
        let db = Db::open_memory()?;

        let result: crate::db::Result<()> = db.transaction(|txn| {
            txn.connection().execute(
                "INSERT INTO changegroup (id, source, created_by, created_at)
                 VALUES ('g1', 'manual', 'editor', 0)",
                [],
            )?;
            Err(crate::db::Error::Validation("forced failure".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db.transaction(|txn| {
            Ok(txn
                .connection()
                .query_row("SELECT COUNT(*) FROM changegroup", [], |row| row.get(0))?)
        })?;
        assert_eq!(count, 0);
        Ok(())
    }
}
