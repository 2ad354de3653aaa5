use crate::db::commit::CommitOutcome;
use crate::db::core::Db;
use crate::db::error::Result;
use crate::db::types::{BulkAction, BulkItem, BulkItemStatus, BulkReport, FieldStatus, Operation};

/// The bulk operator: one action across an arbitrary list of changeset ids,
/// one transaction per item, per-item outcomes collected. A failure on one
/// id never rolls back or blocks the others.
impl Db {
    pub fn bulk(&self, ids: &[&str], action: BulkAction, actor: &str) -> Result<BulkReport> {
        let mut items = Vec::with_capacity(ids.len());
        for id in ids {
            let item = match action {
                BulkAction::ApproveAndCommit => self.bulk_approve_and_commit(id, actor),
                BulkAction::Reject => self.bulk_reject(id, actor),
                BulkAction::Discard => self.bulk_discard(id),
            };
            items.push(item);
        }

        let conflict = items.iter().any(|item| item.conflict.is_some());
        let success = items.iter().all(|item| item.error.is_none());
        Ok(BulkReport { success, conflict, items })
    }

    fn bulk_approve_and_commit(&self, id: &str, actor: &str) -> BulkItem {
        let result = self.transaction(|txn| {
            txn.review_all_fields(id, actor, FieldStatus::Approved)?;
            txn.commit_changeset(id, actor)
        });
        match result {
            Ok(CommitOutcome::Committed) => ok_item(id, BulkItemStatus::Committed),
            Ok(CommitOutcome::Skipped) => ok_item(id, BulkItemStatus::Skipped),
            Ok(CommitOutcome::Blocked(e)) => BulkItem {
                changeset_id: id.to_string(),
                status: BulkItemStatus::Failed,
                error: Some(e.error),
                conflict: e.conflict,
            },
            Err(e) => failed_item(id, e),
        }
    }

    fn bulk_reject(&self, id: &str, actor: &str) -> BulkItem {
        let result = self.transaction(|txn| {
            let changeset = txn.require_changeset(id)?;
            match changeset.operation {
                Operation::Update => {
                    txn.review_all_fields(id, actor, FieldStatus::Rejected)?;
                    // The changeset stays pending and reviewable
                    Ok(BulkItemStatus::Rejected)
                }
                // Create/delete proposals have no field ledger; rejecting
                // them refuses the whole proposal.
                Operation::Create | Operation::Delete => {
                    txn.discard_changeset(id)?;
                    Ok(BulkItemStatus::Discarded)
                }
            }
        });
        match result {
            Ok(status) => ok_item(id, status),
            Err(e) => failed_item(id, e),
        }
    }

    fn bulk_discard(&self, id: &str) -> BulkItem {
        match self.transaction(|txn| txn.discard_changeset(id)) {
            Ok(()) => ok_item(id, BulkItemStatus::Discarded),
            Err(e) => failed_item(id, e),
        }
    }
}

fn ok_item(id: &str, status: BulkItemStatus) -> BulkItem {
    BulkItem {
        changeset_id: id.to_string(),
        status,
        error: None,
        conflict: None,
    }
}

fn failed_item(id: &str, e: crate::db::Error) -> BulkItem {
    log::warn!("bulk operation on changeset {} failed: {}", id, e);
    BulkItem {
        changeset_id: id.to_string(),
        status: BulkItemStatus::Failed,
        error: Some(e.to_string()),
        conflict: None,
    }
}
