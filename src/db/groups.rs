use rusqlite::params;
use uuid::Uuid;

use crate::db::core::{Db, DbTransaction};
use crate::db::error::{Error, Result};
use crate::db::types::{
    now_millis, ChangeSource, Changegroup, Changeset, ChangesetStatus, GroupStatus,
};

/// The changegroup manager: batches of changesets proposed together by one
/// source. Aggregate counters are denormalized onto the changegroup row but
/// always recomputed from the authoritative changeset and field_change rows
/// inside whichever transaction mutated them; they are never incremented in
/// place.
impl Db {
    pub fn create_changegroup(
        &self,
        source: ChangeSource,
        label: Option<&str>,
        description: Option<&str>,
        job_id: Option<&str>,
        created_by: &str,
    ) -> Result<Changegroup> {
        self.transaction(|txn| txn.create_changegroup(source, label, description, job_id, created_by))
    }

    pub fn changegroup(&self, id: &str) -> Result<Changegroup> {
        self.transaction(|txn| txn.require_changegroup(id))
    }

    pub fn changegroups(&self) -> Result<Vec<Changegroup>> {
        self.query(
            "SELECT id, source, label, description, job_id, status, changeset_count,
                    approved_count, rejected_count, created_by, created_at
             FROM changegroup ORDER BY id",
            [],
        )
    }

    /// Non-empty member changesets in proposal order, field changes loaded.
    /// Empty update changesets propose nothing and are not listed.
    pub fn changegroup_changesets(&self, id: &str) -> Result<Vec<Changeset>> {
        self.transaction(|txn| {
            txn.require_changegroup(id)?;
            let ids: Vec<String> = {
                let mut stmt = txn.connection().prepare(
                    "SELECT c.id FROM changeset c
                     WHERE c.changegroup_id = ?
                       AND (c.operation != 'update'
                            OR EXISTS (SELECT 1 FROM field_change f WHERE f.changeset_id = c.id))
                     ORDER BY c.id",
                )?;
                let rows = stmt.query_map([id], |row| row.get(0))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };
            ids.iter().map(|cs_id| txn.require_changeset(cs_id)).collect()
        })
    }

    /// The review queue: every non-empty pending changeset, grouped or not,
    /// in proposal order.
    pub fn pending_changesets(&self) -> Result<Vec<Changeset>> {
        self.transaction(|txn| {
            let ids: Vec<String> = {
                let mut stmt = txn.connection().prepare(
                    "SELECT c.id FROM changeset c
                     WHERE c.status = 'pending'
                       AND (c.operation != 'update'
                            OR EXISTS (SELECT 1 FROM field_change f WHERE f.changeset_id = c.id))
                     ORDER BY c.id",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };
            ids.iter().map(|cs_id| txn.require_changeset(cs_id)).collect()
        })
    }

    /// Discards the changegroup and all of its still-pending changesets.
    /// Already-committed members are untouched; commit is permanent.
    pub fn discard_changegroup(&self, id: &str) -> Result<()> {
        self.transaction(|txn| txn.discard_changegroup(id))
    }

    /// Discards a single pending changeset. Committed changesets are never
    /// discarded.
    pub fn discard_changeset(&self, id: &str) -> Result<()> {
        self.transaction(|txn| txn.discard_changeset(id))
    }
}

impl DbTransaction<'_> {
    pub(crate) fn create_changegroup(
        &self,
        source: ChangeSource,
        label: Option<&str>,
        description: Option<&str>,
        job_id: Option<&str>,
        created_by: &str,
    ) -> Result<Changegroup> {
        let group = Changegroup {
            id: Uuid::now_v7().to_string(),
            source,
            label: label.map(|s| s.to_string()),
            description: description.map(|s| s.to_string()),
            job_id: job_id.map(|s| s.to_string()),
            status: GroupStatus::Pending,
            changeset_count: 0,
            approved_count: 0,
            rejected_count: 0,
            created_by: created_by.to_string(),
            created_at: now_millis(),
        };
        log::debug!("SQL EXECUTE: INSERT INTO changegroup (id = {})", group.id);
        self.connection().execute(
            "INSERT INTO changegroup (id, source, label, description, job_id, status,
                 changeset_count, approved_count, rejected_count, created_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                group.id,
                group.source.as_str(),
                group.label,
                group.description,
                group.job_id,
                group.status.as_str(),
                group.changeset_count,
                group.approved_count,
                group.rejected_count,
                group.created_by,
                group.created_at,
            ],
        )?;
        Ok(group)
    }

    pub(crate) fn require_changegroup(&self, id: &str) -> Result<Changegroup> {
        let rows: Vec<Changegroup> = self.query(
            "SELECT id, source, label, description, job_id, status, changeset_count,
                    approved_count, rejected_count, created_by, created_at
             FROM changegroup WHERE id = ?",
            [id],
        )?;
        rows.into_iter().next().ok_or_else(|| Error::changegroup_not_found(id))
    }

    pub(crate) fn discard_changegroup(&self, id: &str) -> Result<()> {
        let group = self.require_changegroup(id)?;
        if group.status != GroupStatus::Pending {
            return Err(Error::InvalidState(format!(
                "changegroup {} is {}",
                id,
                group.status.as_str()
            )));
        }

        let affected = self.connection().execute(
            "UPDATE changeset SET status = 'discarded', discarded_at = ?
             WHERE changegroup_id = ? AND status = 'pending'",
            params![now_millis(), id],
        )?;
        log::debug!("discarded {} pending changesets of changegroup {}", affected, id);

        self.connection()
            .execute("UPDATE changegroup SET status = 'discarded' WHERE id = ?", [id])?;
        self.refresh_changegroup(id)?;
        Ok(())
    }

    pub(crate) fn discard_changeset(&self, id: &str) -> Result<()> {
        let changeset = self.require_changeset(id)?;
        if changeset.status != ChangesetStatus::Pending {
            return Err(Error::InvalidState(format!(
                "changeset {} is {}",
                id,
                changeset.status.as_str()
            )));
        }
        self.connection().execute(
            "UPDATE changeset SET status = 'discarded', discarded_at = ? WHERE id = ?",
            params![now_millis(), id],
        )?;
        if let Some(group_id) = changeset.changegroup_id.as_deref() {
            self.refresh_changegroup(group_id)?;
        }
        Ok(())
    }

    /// Recomputes the group's denormalized counters and status from the
    /// authoritative changeset rows. Empty update changesets are excluded
    /// from every count. A discarded group stays discarded.
    pub(crate) fn refresh_changegroup(&self, id: &str) -> Result<()> {
        let conn = self.connection();
        let non_empty = "(c.operation != 'update'
             OR EXISTS (SELECT 1 FROM field_change f WHERE f.changeset_id = c.id))";

        let total: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM changeset c WHERE c.changegroup_id = ? AND {non_empty}"
            ),
            [id],
            |row| row.get(0),
        )?;

        // Fully reviewed with at least one approval, or a committed
        // create/delete (those have no field ledger to review).
        let approved: i64 = conn.query_row(
            "SELECT COUNT(*) FROM changeset c
             WHERE c.changegroup_id = ?
               AND ((c.operation = 'update'
                     AND EXISTS (SELECT 1 FROM field_change f
                                 WHERE f.changeset_id = c.id AND f.status = 'approved')
                     AND NOT EXISTS (SELECT 1 FROM field_change f
                                     WHERE f.changeset_id = c.id AND f.status = 'pending'))
                    OR (c.operation != 'update' AND c.status = 'committed'))",
            [id],
            |row| row.get(0),
        )?;

        // Update changesets whose every field change was rejected.
        let rejected: i64 = conn.query_row(
            "SELECT COUNT(*) FROM changeset c
             WHERE c.changegroup_id = ? AND c.operation = 'update'
               AND EXISTS (SELECT 1 FROM field_change f WHERE f.changeset_id = c.id)
               AND NOT EXISTS (SELECT 1 FROM field_change f
                               WHERE f.changeset_id = c.id AND f.status != 'rejected')",
            [id],
            |row| row.get(0),
        )?;

        let pending: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM changeset c
                 WHERE c.changegroup_id = ? AND c.status = 'pending' AND {non_empty}"
            ),
            [id],
            |row| row.get(0),
        )?;
        let committed: i64 = conn.query_row(
            "SELECT COUNT(*) FROM changeset WHERE changegroup_id = ? AND status = 'committed'",
            [id],
            |row| row.get(0),
        )?;

        // The group never force-transitions to committed; its status only
        // reflects whether any pending work remains. Once discarded it
        // stays discarded.
        let current: String = conn.query_row(
            "SELECT status FROM changegroup WHERE id = ?",
            [id],
            |row| row.get(0),
        )?;
        let status = if current == "discarded" {
            GroupStatus::Discarded
        } else if pending > 0 {
            GroupStatus::Pending
        } else if committed > 0 {
            GroupStatus::Committed
        } else if total > 0 {
            GroupStatus::Discarded
        } else {
            GroupStatus::Pending
        };

        conn.execute(
            "UPDATE changegroup SET changeset_count = ?, approved_count = ?,
                 rejected_count = ?, status = ? WHERE id = ?",
            params![total, approved, rejected, status.as_str(), id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::db::types::{ChangeSource, ChangesetStatus, EntityType, GroupStatus};
    use crate::db::Error;
    use crate::Db;

    fn updates(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn counters_recompute_from_member_states() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let group = db.create_changegroup(ChangeSource::AutomatedJob, None, None, None, "bot")?;

        let a = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "a" }))?;
        let b = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "b" }))?;
        let cs_a = db.propose_update(&a, &updates(&[("gloss", json!("a2"))]), "bot", Some(&group.id))?;
        let cs_b = db.propose_update(&b, &updates(&[("gloss", json!("b2"))]), "bot", Some(&group.id))?;

        let g = db.changegroup(&group.id)?;
        assert_eq!(g.changeset_count, 2);
        assert_eq!(g.approved_count, 0);
        assert_eq!(g.rejected_count, 0);

        db.approve_all_fields(&cs_a.id, "reviewer")?;
        db.reject_all_fields(&cs_b.id, "reviewer")?;

        let g = db.changegroup(&group.id)?;
        assert_eq!(g.approved_count, 1);
        assert_eq!(g.rejected_count, 1);
        assert_eq!(g.status, GroupStatus::Pending);
        Ok(())
    }

    #[test]
    fn empty_update_changesets_are_excluded_from_listings_and_counts() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let group = db.create_changegroup(ChangeSource::Manual, None, None, None, "editor")?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "same" }))?;

        // All proposed values match the snapshot: empty changeset
        db.propose_update(&lu, &updates(&[("gloss", json!("same"))]), "editor", Some(&group.id))?;

        assert_eq!(db.changegroup(&group.id)?.changeset_count, 0);
        assert!(db.changegroup_changesets(&group.id)?.is_empty());
        assert!(db.pending_changesets()?.is_empty());
        Ok(())
    }

    #[test]
    fn discard_group_skips_committed_members() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let group = db.create_changegroup(ChangeSource::AutomatedJob, None, None, None, "bot")?;

        let a = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "a" }))?;
        let b = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "b" }))?;
        let cs_a = db.propose_update(&a, &updates(&[("gloss", json!("a2"))]), "bot", Some(&group.id))?;
        let cs_b = db.propose_update(&b, &updates(&[("gloss", json!("b2"))]), "bot", Some(&group.id))?;

        db.approve_all_fields(&cs_a.id, "reviewer")?;
        db.commit_changeset(&cs_a.id, "reviewer")?;

        db.discard_changegroup(&group.id)?;

        assert_eq!(db.changeset(&cs_a.id)?.status, ChangesetStatus::Committed);
        assert_eq!(db.changeset(&cs_b.id)?.status, ChangesetStatus::Discarded);
        assert_eq!(db.changegroup(&group.id)?.status, GroupStatus::Discarded);

        // Discard is terminal for the group
        let err = db.discard_changegroup(&group.id).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        Ok(())
    }

    #[test]
    fn group_status_reflects_remaining_pending_work() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let group = db.create_changegroup(ChangeSource::AutomatedJob, None, None, None, "bot")?;
        let a = db.create_entity(EntityType::LexicalUnit, &json!({ "gloss": "a" }))?;
        let cs = db.propose_update(&a, &updates(&[("gloss", json!("a2"))]), "bot", Some(&group.id))?;

        assert_eq!(db.changegroup(&group.id)?.status, GroupStatus::Pending);

        db.approve_all_fields(&cs.id, "reviewer")?;
        db.commit_changeset(&cs.id, "reviewer")?;

        // No pending members remain and one committed
        assert_eq!(db.changegroup(&group.id)?.status, GroupStatus::Committed);
        Ok(())
    }

    #[test]
    fn scenario_discard_before_commit_leaves_entity_untouched() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let lu = db.create_entity(EntityType::LexicalUnit, &json!({ "lemma": "run" }))?;
        // Walk the entity up to version 5
        let mut current = lu;
        for i in 0..4 {
            let cs = db.propose_update(
                &current,
                &updates(&[("gloss", json!(format!("gloss {i}")))]),
                "editor",
                None,
            )?;
            db.approve_all_fields(&cs.id, "editor")?;
            db.commit_changeset(&cs.id, "editor")?;
            current = db.entity(EntityType::LexicalUnit, current.entity_id)?.unwrap();
        }
        assert_eq!(current.version, 5);

        let cs = db.propose_delete(&current, "editor", None)?;
        db.discard_changeset(&cs.id)?;

        let after = db.entity(EntityType::LexicalUnit, current.entity_id)?.unwrap();
        assert_eq!(after.version, 5);
        assert_eq!(db.changeset(&cs.id)?.status, ChangesetStatus::Discarded);

        // A discarded changeset cannot be committed
        let err = db.commit_changeset(&cs.id, "editor").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        Ok(())
    }

    #[test]
    fn missing_group_is_not_found() -> anyhow::Result<()> {
        let db = Db::open_memory()?;
        let err = db.discard_changegroup("missing").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        Ok(())
    }
}
