use rusqlite::params;
use serde::Deserialize;
use serde_json::Value;

use crate::db::core::{Db, DbTransaction};
use crate::db::error::{Error, Result};
use crate::db::paths::FieldPath;
use crate::db::types::{
    now_millis, Changeset, ChangesetStatus, CommitError, CommitReport, Conflict, FieldStatus,
    Operation,
};

/// Outcome of a single commit attempt inside its transaction. Hard errors
/// (missing changeset, wrong status) surface as `Err` instead.
#[derive(Debug)]
pub(crate) enum CommitOutcome {
    Committed,
    /// Update changeset with no approved fields: nothing to apply.
    Skipped,
    /// Version conflict or missing entity. State was left untouched.
    Blocked(CommitError),
}

/// The commit engine. A commit's read-check-write-increment sequence and
/// the changeset status flip run inside one SQLite transaction, with the
/// entity write issued as a compare-and-swap on the version column; two
/// concurrent commits against the same entity cannot both succeed with a
/// stale version.
impl Db {
    /// Applies one pending changeset to the entity store.
    ///
    /// On conflict the report carries `success = false` and a structured
    /// conflict description; nothing is mutated. An update changeset with
    /// no approved fields is a skip, not a failure. Committing a changeset
    /// that is not pending is `InvalidState` — never a double apply.
    pub fn commit_changeset(&self, changeset_id: &str, actor: &str) -> Result<CommitReport> {
        let outcome = self.transaction(|txn| txn.commit_changeset(changeset_id, actor))?;
        let mut report = CommitReport {
            success: true,
            committed_count: 0,
            skipped_count: 0,
            errors: vec![],
        };
        fold_outcome(&mut report, outcome);
        Ok(report)
    }

    /// Commits every pending changeset in the group, each in its own
    /// transaction. A conflict or skip on one member never aborts the
    /// others; `success` is true iff no member reported an error.
    pub fn commit_changegroup(&self, changegroup_id: &str, actor: &str) -> Result<CommitReport> {
        let members: Vec<PendingMember> = self.transaction(|txn| {
            txn.require_changegroup(changegroup_id)?;
            txn.query(
                "SELECT c.id, c.entity_type, c.entity_id FROM changeset c
                 WHERE c.changegroup_id = ? AND c.status = 'pending'
                   AND (c.operation != 'update'
                        OR EXISTS (SELECT 1 FROM field_change f WHERE f.changeset_id = c.id))
                 ORDER BY c.id",
                [changegroup_id],
            )
        })?;

        let mut report = CommitReport {
            success: true,
            committed_count: 0,
            skipped_count: 0,
            errors: vec![],
        };
        for member in members {
            match self.transaction(|txn| txn.commit_changeset(&member.id, actor)) {
                Ok(outcome) => fold_outcome(&mut report, outcome),
                Err(e) => {
                    // One member's failure must not abort the rest
                    log::warn!("commit of changeset {} failed: {}", member.id, e);
                    report.success = false;
                    report.skipped_count += 1;
                    report.errors.push(CommitError {
                        changeset_id: member.id,
                        entity_type: crate::db::types::EntityType::parse(&member.entity_type)?,
                        entity_id: member.entity_id,
                        error: e.to_string(),
                        conflict: None,
                    });
                }
            }
        }
        Ok(report)
    }
}

fn fold_outcome(report: &mut CommitReport, outcome: CommitOutcome) {
    match outcome {
        CommitOutcome::Committed => report.committed_count += 1,
        CommitOutcome::Skipped => report.skipped_count += 1,
        CommitOutcome::Blocked(error) => {
            report.success = false;
            report.skipped_count += 1;
            report.errors.push(error);
        }
    }
}

#[derive(Deserialize)]
struct PendingMember {
    id: String,
    entity_type: String,
    entity_id: Option<i64>,
}

impl DbTransaction<'_> {
    pub(crate) fn commit_changeset(&self, changeset_id: &str, actor: &str) -> Result<CommitOutcome> {
        let changeset = self.require_changeset(changeset_id)?;
        if changeset.status != ChangesetStatus::Pending {
            return Err(Error::InvalidState(format!(
                "changeset {} is {}",
                changeset.id,
                changeset.status.as_str()
            )));
        }

        match changeset.operation {
            Operation::Update => self.commit_update(&changeset, actor),
            Operation::Create => self.commit_create(&changeset, actor),
            Operation::Delete => self.commit_delete(&changeset, actor),
        }
    }

    fn commit_update(&self, changeset: &Changeset, actor: &str) -> Result<CommitOutcome> {
        let approved: Vec<_> = changeset
            .field_changes
            .iter()
            .filter(|fc| fc.status == FieldStatus::Approved)
            .collect();
        if approved.is_empty() {
            log::debug!("changeset {} has no approved fields, skipping", changeset.id);
            return Ok(CommitOutcome::Skipped);
        }

        let entity_id = changeset.entity_id.ok_or_else(|| {
            Error::InvalidState(format!("update changeset {} has no entity id", changeset.id))
        })?;
        let entity = match self.entity(changeset.entity_type, entity_id)? {
            Some(entity) => entity,
            None => return Ok(CommitOutcome::Blocked(entity_missing(changeset))),
        };
        if Some(entity.version) != changeset.entity_version {
            return Ok(CommitOutcome::Blocked(version_conflict(changeset, entity.version)));
        }

        let mut data = entity.data;
        for fc in &approved {
            let path = FieldPath::parse(&fc.field_name)?;
            path.set_value(&mut data, fc.new_value.clone().unwrap_or(Value::Null))?;
        }

        let wrote = self.update_entity_cas(changeset.entity_type, entity_id, &data, entity.version)?;
        if !wrote {
            // The version moved under us; inside a transaction this means a
            // concurrent writer won the race before we started.
            return Ok(CommitOutcome::Blocked(version_conflict(changeset, entity.version)));
        }

        self.mark_committed(changeset, actor)?;
        Ok(CommitOutcome::Committed)
    }

    fn commit_create(&self, changeset: &Changeset, actor: &str) -> Result<CommitOutcome> {
        let snapshot = changeset.after_snapshot.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("create changeset {} has no snapshot", changeset.id))
        })?;

        let row = self.create_entity(changeset.entity_type, snapshot)?;
        // Back-fill the id the store allocated
        self.connection().execute(
            "UPDATE changeset SET entity_id = ? WHERE id = ?",
            params![row.entity_id, changeset.id],
        )?;

        self.mark_committed(changeset, actor)?;
        Ok(CommitOutcome::Committed)
    }

    fn commit_delete(&self, changeset: &Changeset, actor: &str) -> Result<CommitOutcome> {
        let entity_id = changeset.entity_id.ok_or_else(|| {
            Error::InvalidState(format!("delete changeset {} has no entity id", changeset.id))
        })?;
        let current_version = match self.entity_version(changeset.entity_type, entity_id)? {
            Some(version) => version,
            None => return Ok(CommitOutcome::Blocked(entity_missing(changeset))),
        };
        if Some(current_version) != changeset.entity_version {
            return Ok(CommitOutcome::Blocked(version_conflict(changeset, current_version)));
        }

        let deleted = self.delete_entity_cas(changeset.entity_type, entity_id, current_version)?;
        if !deleted {
            return Ok(CommitOutcome::Blocked(version_conflict(changeset, current_version)));
        }

        self.mark_committed(changeset, actor)?;
        Ok(CommitOutcome::Committed)
    }

    fn mark_committed(&self, changeset: &Changeset, actor: &str) -> Result<()> {
        let affected = self.connection().execute(
            "UPDATE changeset SET status = 'committed', committed_by = ?, committed_at = ?
             WHERE id = ? AND status = 'pending'",
            params![actor, now_millis(), changeset.id],
        )?;
        if affected != 1 {
            return Err(Error::InvalidState(format!(
                "changeset {} was transitioned concurrently",
                changeset.id
            )));
        }
        if let Some(group_id) = changeset.changegroup_id.as_deref() {
            self.refresh_changegroup(group_id)?;
        }
        Ok(())
    }
}

fn version_conflict(changeset: &Changeset, current_version: i64) -> CommitError {
    log::warn!(
        "version conflict on {} {:?}: expected {:?}, current {}",
        changeset.entity_type.as_str(),
        changeset.entity_id,
        changeset.entity_version,
        current_version
    );
    CommitError {
        changeset_id: changeset.id.clone(),
        entity_type: changeset.entity_type,
        entity_id: changeset.entity_id,
        error: "version conflict".to_string(),
        conflict: Some(Conflict::version(changeset.entity_version, Some(current_version))),
    }
}

fn entity_missing(changeset: &Changeset) -> CommitError {
    log::warn!(
        "commit target missing: {} {:?}",
        changeset.entity_type.as_str(),
        changeset.entity_id
    );
    CommitError {
        changeset_id: changeset.id.clone(),
        entity_type: changeset.entity_type,
        entity_id: changeset.entity_id,
        error: "entity not found".to_string(),
        conflict: Some(Conflict::version(changeset.entity_version, None)),
    }
}
