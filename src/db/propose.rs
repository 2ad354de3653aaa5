use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::db::core::{Db, DbTransaction};
use crate::db::error::{Error, Result};
use crate::db::paths::FieldPath;
use crate::db::types::{
    now_millis, Changeset, ChangesetStatus, EntityRow, EntityType, FieldChange, FieldStatus,
    GroupStatus, Operation,
};

/// The changeset factory: builds and persists proposals. An update proposal
/// is diffed against the caller-supplied current snapshot; only fields whose
/// proposed value actually differs get a FieldChange. The changeset and all
/// of its field changes are written in one transaction.
impl Db {
    pub fn propose_update(
        &self,
        current: &EntityRow,
        updates: &serde_json::Map<String, Value>,
        created_by: &str,
        changegroup_id: Option<&str>,
    ) -> Result<Changeset> {
        self.transaction(|txn| txn.propose_update(current, updates, created_by, changegroup_id))
    }

    pub fn propose_create(
        &self,
        entity_type: EntityType,
        proposed: &Value,
        created_by: &str,
        changegroup_id: Option<&str>,
    ) -> Result<Changeset> {
        self.transaction(|txn| txn.propose_create(entity_type, proposed, created_by, changegroup_id))
    }

    pub fn propose_delete(
        &self,
        current: &EntityRow,
        created_by: &str,
        changegroup_id: Option<&str>,
    ) -> Result<Changeset> {
        self.transaction(|txn| txn.propose_delete(current, created_by, changegroup_id))
    }

    /// Loads a changeset with its field changes in proposal order.
    pub fn changeset(&self, id: &str) -> Result<Changeset> {
        self.transaction(|txn| txn.require_changeset(id))
    }
}

impl DbTransaction<'_> {
    pub fn propose_update(
        &self,
        current: &EntityRow,
        updates: &serde_json::Map<String, Value>,
        created_by: &str,
        changegroup_id: Option<&str>,
    ) -> Result<Changeset> {
        if updates.is_empty() {
            return Err(Error::Validation("no updates proposed".to_string()));
        }

        let changeset_id = Uuid::now_v7().to_string();
        let schema = current.entity_type.fields();
        let mut field_changes = Vec::new();
        for (field_name, proposed) in updates {
            let path = FieldPath::parse(field_name)?;
            if !schema.iter().any(|f| *f == path.root()) {
                return Err(Error::Validation(format!(
                    "unrecognized field '{}' for entity type '{}'",
                    path,
                    current.entity_type.as_str()
                )));
            }
            let old_value = path.value_at(&current.data);
            // No-op fields are silently dropped
            if old_value == Some(proposed) {
                continue;
            }
            field_changes.push(FieldChange {
                id: Uuid::now_v7().to_string(),
                changeset_id: changeset_id.clone(),
                field_name: field_name.clone(),
                old_value: old_value.cloned(),
                new_value: Some(proposed.clone()),
                status: FieldStatus::Pending,
                approved_by: None,
                approved_at: None,
                rejected_by: None,
                rejected_at: None,
            });
        }

        let changeset = Changeset {
            id: changeset_id,
            changegroup_id: changegroup_id.map(|s| s.to_string()),
            entity_type: current.entity_type,
            entity_id: Some(current.entity_id),
            operation: Operation::Update,
            entity_version: Some(current.version),
            before_snapshot: None,
            after_snapshot: None,
            status: ChangesetStatus::Pending,
            created_by: created_by.to_string(),
            created_at: now_millis(),
            committed_by: None,
            committed_at: None,
            discarded_at: None,
            field_changes,
        };
        self.insert_changeset(&changeset)?;
        Ok(changeset)
    }

    pub fn propose_create(
        &self,
        entity_type: EntityType,
        proposed: &Value,
        created_by: &str,
        changegroup_id: Option<&str>,
    ) -> Result<Changeset> {
        let Some(fields) = proposed.as_object() else {
            return Err(Error::Validation("proposed entity must be an object".to_string()));
        };
        if fields.is_empty() {
            return Err(Error::Validation("proposed entity is empty".to_string()));
        }
        let schema = entity_type.fields();
        for field_name in fields.keys() {
            if !schema.iter().any(|f| f == field_name) {
                return Err(Error::Validation(format!(
                    "unrecognized field '{}' for entity type '{}'",
                    field_name,
                    entity_type.as_str()
                )));
            }
        }

        let changeset = Changeset {
            id: Uuid::now_v7().to_string(),
            changegroup_id: changegroup_id.map(|s| s.to_string()),
            entity_type,
            entity_id: None,
            operation: Operation::Create,
            entity_version: None,
            before_snapshot: None,
            after_snapshot: Some(proposed.clone()),
            status: ChangesetStatus::Pending,
            created_by: created_by.to_string(),
            created_at: now_millis(),
            committed_by: None,
            committed_at: None,
            discarded_at: None,
            field_changes: vec![],
        };
        self.insert_changeset(&changeset)?;
        Ok(changeset)
    }

    pub fn propose_delete(
        &self,
        current: &EntityRow,
        created_by: &str,
        changegroup_id: Option<&str>,
    ) -> Result<Changeset> {
        let changeset = Changeset {
            id: Uuid::now_v7().to_string(),
            changegroup_id: changegroup_id.map(|s| s.to_string()),
            entity_type: current.entity_type,
            entity_id: Some(current.entity_id),
            operation: Operation::Delete,
            entity_version: Some(current.version),
            before_snapshot: Some(current.data.clone()),
            after_snapshot: None,
            status: ChangesetStatus::Pending,
            created_by: created_by.to_string(),
            created_at: now_millis(),
            committed_by: None,
            committed_at: None,
            discarded_at: None,
            field_changes: vec![],
        };
        self.insert_changeset(&changeset)?;
        Ok(changeset)
    }

    fn insert_changeset(&self, changeset: &Changeset) -> Result<()> {
        if let Some(group_id) = changeset.changegroup_id.as_deref() {
            let group = self.require_changegroup(group_id)?;
            if group.status != GroupStatus::Pending {
                return Err(Error::InvalidState(format!(
                    "changegroup {} is {}",
                    group_id,
                    group.status.as_str()
                )));
            }
        }

        log::debug!("SQL EXECUTE: INSERT INTO changeset (id = {})", changeset.id);
        self.connection().execute(
            "INSERT INTO changeset (id, changegroup_id, entity_type, entity_id, operation,
                 entity_version, before_snapshot, after_snapshot, status, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                changeset.id,
                changeset.changegroup_id,
                changeset.entity_type.as_str(),
                changeset.entity_id,
                changeset.operation.as_str(),
                changeset.entity_version,
                changeset.before_snapshot.as_ref().map(|v| v.to_string()),
                changeset.after_snapshot.as_ref().map(|v| v.to_string()),
                changeset.status.as_str(),
                changeset.created_by,
                changeset.created_at,
            ],
        )?;

        for (position, fc) in changeset.field_changes.iter().enumerate() {
            self.connection().execute(
                "INSERT INTO field_change (id, changeset_id, position, field_name,
                     old_value, new_value, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    fc.id,
                    fc.changeset_id,
                    position as i64,
                    fc.field_name,
                    fc.old_value.as_ref().map(|v| v.to_string()),
                    fc.new_value.as_ref().map(|v| v.to_string()),
                    fc.status.as_str(),
                ],
            )?;
        }

        if let Some(group_id) = changeset.changegroup_id.as_deref() {
            self.refresh_changegroup(group_id)?;
        }
        Ok(())
    }

    pub fn changeset(&self, id: &str) -> Result<Option<Changeset>> {
        let rows: Vec<ChangesetRow> = self.query(
            "SELECT id, changegroup_id, entity_type, entity_id, operation, entity_version,
                    before_snapshot, after_snapshot, status, created_by, created_at,
                    committed_by, committed_at, discarded_at
             FROM changeset WHERE id = ?",
            [id],
        )?;
        match rows.into_iter().next() {
            Some(row) => {
                let field_changes = self.changeset_field_changes(id)?;
                Ok(Some(row.into_changeset(field_changes)?))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn require_changeset(&self, id: &str) -> Result<Changeset> {
        self.changeset(id)?.ok_or_else(|| Error::changeset_not_found(id))
    }

    pub fn changeset_field_changes(&self, changeset_id: &str) -> Result<Vec<FieldChange>> {
        let rows: Vec<FieldChangeRow> = self.query(
            "SELECT id, changeset_id, field_name, old_value, new_value, status,
                    approved_by, approved_at, rejected_by, rejected_at
             FROM field_change WHERE changeset_id = ? ORDER BY position",
            [changeset_id],
        )?;
        rows.into_iter().map(|row| row.into_field_change()).collect()
    }

    pub(crate) fn field_change(&self, id: &str) -> Result<Option<FieldChange>> {
        let rows: Vec<FieldChangeRow> = self.query(
            "SELECT id, changeset_id, field_name, old_value, new_value, status,
                    approved_by, approved_at, rejected_by, rejected_at
             FROM field_change WHERE id = ?",
            [id],
        )?;
        rows.into_iter().next().map(|row| row.into_field_change()).transpose()
    }
}

/// Raw changeset row as stored; enums and JSON columns are TEXT until
/// converted by into_changeset.
#[derive(Deserialize)]
struct ChangesetRow {
    id: String,
    changegroup_id: Option<String>,
    entity_type: String,
    entity_id: Option<i64>,
    operation: String,
    entity_version: Option<i64>,
    before_snapshot: Option<String>,
    after_snapshot: Option<String>,
    status: String,
    created_by: String,
    created_at: i64,
    committed_by: Option<String>,
    committed_at: Option<i64>,
    discarded_at: Option<i64>,
}

impl ChangesetRow {
    fn into_changeset(self, field_changes: Vec<FieldChange>) -> Result<Changeset> {
        Ok(Changeset {
            id: self.id,
            changegroup_id: self.changegroup_id,
            entity_type: EntityType::parse(&self.entity_type)?,
            entity_id: self.entity_id,
            operation: Operation::parse(&self.operation)?,
            entity_version: self.entity_version,
            before_snapshot: self.before_snapshot.as_deref().map(serde_json::from_str).transpose()?,
            after_snapshot: self.after_snapshot.as_deref().map(serde_json::from_str).transpose()?,
            status: ChangesetStatus::parse(&self.status)?,
            created_by: self.created_by,
            created_at: self.created_at,
            committed_by: self.committed_by,
            committed_at: self.committed_at,
            discarded_at: self.discarded_at,
            field_changes,
        })
    }
}

#[derive(Deserialize)]
struct FieldChangeRow {
    id: String,
    changeset_id: String,
    field_name: String,
    old_value: Option<String>,
    new_value: Option<String>,
    status: String,
    approved_by: Option<String>,
    approved_at: Option<i64>,
    rejected_by: Option<String>,
    rejected_at: Option<i64>,
}

impl FieldChangeRow {
    fn into_field_change(self) -> Result<FieldChange> {
        Ok(FieldChange {
            id: self.id,
            changeset_id: self.changeset_id,
            field_name: self.field_name,
            old_value: self.old_value.as_deref().map(serde_json::from_str).transpose()?,
            new_value: self.new_value.as_deref().map(serde_json::from_str).transpose()?,
            status: FieldStatus::parse(&self.status)?,
            approved_by: self.approved_by,
            approved_at: self.approved_at,
            rejected_by: self.rejected_by,
            rejected_at: self.rejected_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::Db;

    fn updates(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn update_emits_field_change_iff_value_differs() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(
            EntityType::LexicalUnit,
            &json!({ "lemma": "run", "gloss": "old", "pos": "V" }),
        )?;

        let cs = db.propose_update(
            &lu,
            &updates(&[
                ("gloss", json!("new")),
                ("pos", json!("V")), // unchanged: dropped
                ("lemma", json!("run")), // unchanged: dropped
            ]),
            "bot",
            None,
        )?;

        assert_eq!(cs.operation, Operation::Update);
        assert_eq!(cs.entity_version, Some(1));
        assert_eq!(cs.field_changes.len(), 1);
        let fc = &cs.field_changes[0];
        assert_eq!(fc.field_name, "gloss");
        assert_eq!(fc.old_value, Some(json!("old")));
        assert_eq!(fc.new_value, Some(json!("new")));
        assert_eq!(fc.status, FieldStatus::Pending);

        // Round-trip through the loader
        let loaded = db.changeset(&cs.id)?;
        assert_eq!(loaded.field_changes.len(), 1);
        assert_eq!(loaded.field_changes[0].old_value, Some(json!("old")));
        Ok(())
    }

    #[test]
    fn update_supports_dotted_sub_field_paths() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let frame = db.create_entity(
            EntityType::Frame,
            &json!({
                "name": "Motion",
                "frame_roles": { "AGENT": { "description": "the mover" } }
            }),
        )?;

        let cs = db.propose_update(
            &frame,
            &updates(&[
                ("frame_roles.AGENT.description", json!("the self-mover")),
                ("frame_roles.THEME.description", json!("what moves")),
            ]),
            "editor",
            None,
        )?;

        assert_eq!(cs.field_changes.len(), 2);
        let agent = cs
            .field_changes
            .iter()
            .find(|fc| fc.field_name == "frame_roles.AGENT.description")
            .unwrap();
        assert_eq!(agent.old_value, Some(json!("the mover")));
        let theme = cs
            .field_changes
            .iter()
            .find(|fc| fc.field_name == "frame_roles.THEME.description")
            .unwrap();
        assert_eq!(theme.old_value, None); // key absent in snapshot
        Ok(())
    }

    #[test]
    fn update_rejects_empty_and_unrecognized_input() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "lemma": "run" }))?;

        let err = db.propose_update(&lu, &updates(&[]), "bot", None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = db
            .propose_update(&lu, &updates(&[("color", json!("red"))]), "bot", None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // Nothing persisted on validation failure
        let count: i64 = db.transaction(|txn| {
            Ok(txn
                .connection()
                .query_row("SELECT COUNT(*) FROM changeset", [], |row| row.get(0))?)
        })?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn all_noop_update_persists_an_empty_changeset() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "lemma": "run" }))?;

        let cs = db.propose_update(&lu, &updates(&[("lemma", json!("run"))]), "bot", None)?;
        assert!(cs.is_empty());
        assert!(db.changeset(&cs.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn create_stores_after_snapshot_without_field_changes() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let proposed = json!({ "lemma": "saunter", "pos": "V" });
        let cs = db.propose_create(EntityType::LexicalUnit, &proposed, "bot", None)?;

        assert_eq!(cs.operation, Operation::Create);
        assert_eq!(cs.entity_id, None);
        assert_eq!(cs.entity_version, None);
        assert_eq!(cs.after_snapshot, Some(proposed));
        assert!(cs.field_changes.is_empty());
        assert!(!cs.is_empty());

        let err = db
            .propose_create(EntityType::LexicalUnit, &json!({ "bogus": 1 }), "bot", None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        Ok(())
    }

    #[test]
    fn delete_stores_before_snapshot_and_version() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "lemma": "run" }))?;

        let cs = db.propose_delete(&lu, "editor", None)?;
        assert_eq!(cs.operation, Operation::Delete);
        assert_eq!(cs.entity_version, Some(1));
        assert_eq!(cs.before_snapshot, Some(json!({ "lemma": "run" })));
        Ok(())
    }

    #[test]
    fn propose_into_missing_group_fails() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "lemma": "run" }))?;

        let err = db
            .propose_update(&lu, &updates(&[("lemma", json!("ran"))]), "bot", Some("nope"))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        Ok(())
    }
}
