use rusqlite::params;

use crate::db::core::{Db, DbTransaction};
use crate::db::error::{Error, Result};
use crate::db::types::{now_millis, ChangesetStatus, FieldChange, FieldStatus};

/// The review engine: approve/reject transitions on the field change
/// ledger. Purely a ledger mutation; the entity store is never touched
/// here, and approval does not imply commit.
impl Db {
    pub fn approve_field(&self, field_change_id: &str, actor: &str) -> Result<FieldChange> {
        self.transaction(|txn| txn.review_field(field_change_id, actor, FieldStatus::Approved))
    }

    pub fn reject_field(&self, field_change_id: &str, actor: &str) -> Result<FieldChange> {
        self.transaction(|txn| txn.review_field(field_change_id, actor, FieldStatus::Rejected))
    }

    /// Approves every pending field of the changeset. Returns the number of
    /// fields affected; 0 is not an error.
    pub fn approve_all_fields(&self, changeset_id: &str, actor: &str) -> Result<usize> {
        self.transaction(|txn| txn.review_all_fields(changeset_id, actor, FieldStatus::Approved))
    }

    /// Rejects every pending field of the changeset. The changeset itself
    /// stays pending and reviewable.
    pub fn reject_all_fields(&self, changeset_id: &str, actor: &str) -> Result<usize> {
        self.transaction(|txn| txn.review_all_fields(changeset_id, actor, FieldStatus::Rejected))
    }
}

impl DbTransaction<'_> {
    pub(crate) fn review_field(
        &self,
        field_change_id: &str,
        actor: &str,
        to: FieldStatus,
    ) -> Result<FieldChange> {
        let field = self
            .field_change(field_change_id)?
            .ok_or_else(|| Error::field_change_not_found(field_change_id))?;
        let changeset = self.require_changeset(&field.changeset_id)?;
        if changeset.status != ChangesetStatus::Pending {
            return Err(Error::InvalidState(format!(
                "changeset {} is {}",
                changeset.id,
                changeset.status.as_str()
            )));
        }
        if field.status != FieldStatus::Pending {
            return Err(Error::InvalidState(format!(
                "field change {} is already {}",
                field.id,
                field.status.as_str()
            )));
        }

        let (sql, verb) = match to {
            FieldStatus::Approved => (
                "UPDATE field_change SET status = 'approved', approved_by = ?, approved_at = ?
                 WHERE id = ? AND status = 'pending'",
                "approve",
            ),
            FieldStatus::Rejected => (
                "UPDATE field_change SET status = 'rejected', rejected_by = ?, rejected_at = ?
                 WHERE id = ? AND status = 'pending'",
                "reject",
            ),
            FieldStatus::Pending => {
                return Err(Error::InvalidState(
                    "cannot transition a field change back to pending".to_string(),
                ))
            }
        };

        log::debug!("SQL EXECUTE: {} field change {}", verb, field_change_id);
        let affected = self.connection().execute(sql, params![actor, now_millis(), field_change_id])?;
        if affected != 1 {
            return Err(Error::InvalidState(format!(
                "field change {field_change_id} was transitioned concurrently"
            )));
        }

        if let Some(group_id) = changeset.changegroup_id.as_deref() {
            self.refresh_changegroup(group_id)?;
        }
        self.field_change(field_change_id)?
            .ok_or_else(|| Error::field_change_not_found(field_change_id))
    }

    pub(crate) fn review_all_fields(
        &self,
        changeset_id: &str,
        actor: &str,
        to: FieldStatus,
    ) -> Result<usize> {
        let changeset = self.require_changeset(changeset_id)?;
        if changeset.status != ChangesetStatus::Pending {
            return Err(Error::InvalidState(format!(
                "changeset {} is {}",
                changeset.id,
                changeset.status.as_str()
            )));
        }

        let sql = match to {
            FieldStatus::Approved => {
                "UPDATE field_change SET status = 'approved', approved_by = ?, approved_at = ?
                 WHERE changeset_id = ? AND status = 'pending'"
            }
            FieldStatus::Rejected => {
                "UPDATE field_change SET status = 'rejected', rejected_by = ?, rejected_at = ?
                 WHERE changeset_id = ? AND status = 'pending'"
            }
            FieldStatus::Pending => {
                return Err(Error::InvalidState(
                    "cannot transition field changes back to pending".to_string(),
                ))
            }
        };

        let affected = self.connection().execute(sql, params![actor, now_millis(), changeset_id])?;
        log::debug!(
            "SQL EXECUTE RESULT: {} field changes of {} -> {}",
            affected,
            changeset_id,
            to.as_str()
        );

        if let Some(group_id) = changeset.changegroup_id.as_deref() {
            self.refresh_changegroup(group_id)?;
        }
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::db::types::{EntityType, FieldStatus};
    use crate::db::Error;
    use crate::Db;

    fn updates(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn approve_field_records_actor_and_timestamp() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "old" }))?;
        let cs = db.propose_update(&lu, &updates(&[("gloss", json!("new"))]), "bot", None)?;

        let fc = db.approve_field(&cs.field_changes[0].id, "reviewer")?;
        assert_eq!(fc.status, FieldStatus::Approved);
        assert_eq!(fc.approved_by.as_deref(), Some("reviewer"));
        assert!(fc.approved_at.is_some());
        // Exactly one of the approve/reject audit pairs is populated
        assert!(fc.rejected_by.is_none());
        assert!(fc.rejected_at.is_none());
        Ok(())
    }

    #[test]
    fn reviewing_a_non_pending_field_fails() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "old" }))?;
        let cs = db.propose_update(&lu, &updates(&[("gloss", json!("new"))]), "bot", None)?;

        db.approve_field(&cs.field_changes[0].id, "reviewer")?;
        let err = db.reject_field(&cs.field_changes[0].id, "reviewer").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        Ok(())
    }

    #[test]
    fn approve_all_transitions_only_pending_fields() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(
            EntityType::LexicalUnit,
            &json!({ "gloss": "a", "pos": "N", "lemma": "x" }),
        )?;
        let cs = db.propose_update(
            &lu,
            &updates(&[("gloss", json!("b")), ("pos", json!("V")), ("lemma", json!("y"))]),
            "bot",
            None,
        )?;

        db.reject_field(&cs.field_changes[0].id, "reviewer")?;
        let affected = db.approve_all_fields(&cs.id, "reviewer")?;
        assert_eq!(affected, 2);

        // Second pass has nothing left to do
        assert_eq!(db.approve_all_fields(&cs.id, "reviewer")?, 0);

        let loaded = db.changeset(&cs.id)?;
        let approved = loaded
            .field_changes
            .iter()
            .filter(|fc| fc.status == FieldStatus::Approved)
            .count();
        assert_eq!(approved, 2);
        Ok(())
    }

    #[test]
    fn review_on_a_discarded_changeset_fails() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "old" }))?;
        let cs = db.propose_update(&lu, &updates(&[("gloss", json!("new"))]), "bot", None)?;

        db.discard_changeset(&cs.id)?;
        let err = db.approve_field(&cs.field_changes[0].id, "reviewer").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = db.approve_all_fields(&cs.id, "reviewer").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        Ok(())
    }
}
