use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use crate::db::core::{Db, DbTransaction};
use crate::db::error::Result;
use crate::db::types::{EntityRow, EntityType};

/// The canonical entity store: one row per catalog entity, keyed by
/// (entity_type, entity_id), holding the full JSON document and a version
/// counter. The version column is the sole mutual-exclusion mechanism;
/// every write goes through a compare-and-swap on it.
impl Db {
    pub fn entity(&self, entity_type: EntityType, entity_id: i64) -> Result<Option<EntityRow>> {
        self.transaction(|txn| txn.entity(entity_type, entity_id))
    }

    /// Inserts a new canonical row at version 1, allocating the next
    /// numeric id for the entity type. This is the seeding path; proposed
    /// creates go through the commit engine instead.
    pub fn create_entity(&self, entity_type: EntityType, data: &Value) -> Result<EntityRow> {
        self.transaction(|txn| txn.create_entity(entity_type, data))
    }
}

impl DbTransaction<'_> {
    pub fn entity(&self, entity_type: EntityType, entity_id: i64) -> Result<Option<EntityRow>> {
        let row = self
            .connection()
            .query_row(
                "SELECT version, data FROM entity WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), entity_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((version, data)) => Ok(Some(EntityRow {
                entity_type,
                entity_id,
                version,
                data: serde_json::from_str(&data)?,
            })),
            None => Ok(None),
        }
    }

    pub fn entity_version(&self, entity_type: EntityType, entity_id: i64) -> Result<Option<i64>> {
        let version = self
            .connection()
            .query_row(
                "SELECT version FROM entity WHERE entity_type = ? AND entity_id = ?",
                params![entity_type.as_str(), entity_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    pub fn create_entity(&self, entity_type: EntityType, data: &Value) -> Result<EntityRow> {
        let entity_id: i64 = self.connection().query_row(
            "SELECT COALESCE(MAX(entity_id), 0) + 1 FROM entity WHERE entity_type = ?",
            params![entity_type.as_str()],
            |row| row.get(0),
        )?;

        log::debug!("SQL EXECUTE: INSERT INTO entity ({}, {})", entity_type.as_str(), entity_id);
        self.connection().execute(
            "INSERT INTO entity (entity_type, entity_id, version, data) VALUES (?, ?, 1, ?)",
            params![entity_type.as_str(), entity_id, data.to_string()],
        )?;

        Ok(EntityRow {
            entity_type,
            entity_id,
            version: 1,
            data: data.clone(),
        })
    }

    /// Replaces the entity document and bumps the version by exactly 1, but
    /// only if the stored version still equals `expected_version`. Returns
    /// whether a row was written.
    pub(crate) fn update_entity_cas(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        data: &Value,
        expected_version: i64,
    ) -> Result<bool> {
        log::debug!(
            "SQL EXECUTE: UPDATE entity SET data, version = {} + 1 WHERE ({}, {}) AND version = {}",
            expected_version,
            entity_type.as_str(),
            entity_id,
            expected_version
        );
        let affected = self.connection().execute(
            "UPDATE entity SET data = ?, version = version + 1
             WHERE entity_type = ? AND entity_id = ? AND version = ?",
            params![data.to_string(), entity_type.as_str(), entity_id, expected_version],
        )?;
        Ok(affected == 1)
    }

    /// Removes the entity row, but only if the stored version still equals
    /// `expected_version`. Returns whether a row was deleted.
    pub(crate) fn delete_entity_cas(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        expected_version: i64,
    ) -> Result<bool> {
        log::debug!(
            "SQL EXECUTE: DELETE FROM entity WHERE ({}, {}) AND version = {}",
            entity_type.as_str(),
            entity_id,
            expected_version
        );
        let affected = self.connection().execute(
            "DELETE FROM entity WHERE entity_type = ? AND entity_id = ? AND version = ?",
            params![entity_type.as_str(), entity_id, expected_version],
        )?;
        Ok(affected == 1)
    }
}
