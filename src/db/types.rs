use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::error::{Error, Result};

/// The closed set of catalog entity types the engine mutates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    LexicalUnit,
    Frame,
    Relation,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::LexicalUnit => "lexical_unit",
            EntityType::Frame => "frame",
            EntityType::Relation => "relation",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "lexical_unit" => Ok(EntityType::LexicalUnit),
            "frame" => Ok(EntityType::Frame),
            "relation" => Ok(EntityType::Relation),
            other => Err(Error::Validation(format!("unknown entity type '{other}'"))),
        }
    }

    /// Recognized top-level fields for this entity type. Proposals naming a
    /// field whose root segment is not in this list are rejected before any
    /// record is created.
    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            EntityType::LexicalUnit => {
                &["lemma", "pos", "gloss", "definition", "examples", "frame_id"]
            }
            EntityType::Frame => {
                &["name", "description", "frame_roles", "parent_frame_id"]
            }
            EntityType::Relation => {
                &["relation_type", "source_id", "target_id", "notes"]
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(Error::Validation(format!("unknown operation '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangesetStatus {
    Pending,
    Committed,
    Discarded,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Committed => "committed",
            ChangesetStatus::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "committed" => Ok(ChangesetStatus::Committed),
            "discarded" => Ok(ChangesetStatus::Discarded),
            other => Err(Error::Validation(format!("unknown changeset status '{other}'"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Pending,
    Committed,
    Discarded,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Committed => "committed",
            GroupStatus::Discarded => "discarded",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStatus {
    Pending,
    Approved,
    Rejected,
}

impl FieldStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldStatus::Pending => "pending",
            FieldStatus::Approved => "approved",
            FieldStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(FieldStatus::Pending),
            "approved" => Ok(FieldStatus::Approved),
            "rejected" => Ok(FieldStatus::Rejected),
            other => Err(Error::Validation(format!("unknown field status '{other}'"))),
        }
    }
}

/// Where a changegroup's proposals came from: one automated job, one manual
/// editing session, or something else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeSource {
    AutomatedJob,
    Manual,
    Other,
}

impl ChangeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSource::AutomatedJob => "automated_job",
            ChangeSource::Manual => "manual",
            ChangeSource::Other => "other",
        }
    }
}

/// A canonical catalog row: the full entity document plus the version
/// counter bumped on every successful write.
#[derive(Clone, Debug, Serialize)]
pub struct EntityRow {
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub version: i64,
    pub data: Value,
}

/// A batch of changesets proposed together by one source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Changegroup {
    pub id: String,
    pub source: ChangeSource,
    pub label: Option<String>,
    pub description: Option<String>,
    pub job_id: Option<String>,
    pub status: GroupStatus,
    pub changeset_count: i64,
    pub approved_count: i64,
    pub rejected_count: i64,
    pub created_by: String,
    pub created_at: i64,
}

/// One proposed mutation (create/update/delete) to one entity.
#[derive(Clone, Debug, Serialize)]
pub struct Changeset {
    pub id: String,
    pub changegroup_id: Option<String>,
    pub entity_type: EntityType,
    pub entity_id: Option<i64>,
    pub operation: Operation,
    /// Version of the target entity at proposal time. None for create.
    pub entity_version: Option<i64>,
    pub before_snapshot: Option<Value>,
    pub after_snapshot: Option<Value>,
    pub status: ChangesetStatus,
    pub created_by: String,
    pub created_at: i64,
    pub committed_by: Option<String>,
    pub committed_at: Option<i64>,
    pub discarded_at: Option<i64>,
    /// Ordered field changes. Only meaningful for update changesets.
    pub field_changes: Vec<FieldChange>,
}

impl Changeset {
    /// An update changeset with zero field changes proposes nothing; it is
    /// excluded from review listings and aggregate counts.
    pub fn is_empty(&self) -> bool {
        self.operation == Operation::Update && self.field_changes.is_empty()
    }
}

/// One proposed old->new value pair within an update changeset.
#[derive(Clone, Debug, Serialize)]
pub struct FieldChange {
    pub id: String,
    pub changeset_id: String,
    /// Dotted path, e.g. `frame_roles.AGENT.description`.
    pub field_name: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub status: FieldStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<i64>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<i64>,
}

/// Structured description of a version mismatch detected at commit time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub field_name: &'static str,
    pub expected_value: Option<i64>,
    pub current_value: Option<i64>,
    pub proposed_value: Option<i64>,
}

impl Conflict {
    pub(crate) fn version(expected: Option<i64>, current: Option<i64>) -> Self {
        Conflict {
            field_name: "version",
            expected_value: expected,
            current_value: current,
            proposed_value: expected.map(|v| v + 1),
        }
    }
}

/// Per-changeset failure detail within a commit or bulk report.
#[derive(Clone, Debug, Serialize)]
pub struct CommitError {
    pub changeset_id: String,
    pub entity_type: EntityType,
    pub entity_id: Option<i64>,
    pub error: String,
    pub conflict: Option<Conflict>,
}

/// Outcome of committing one changeset or a whole changegroup. A conflict
/// on one member never aborts the others; it lands in `errors` and the
/// member counts as skipped.
#[derive(Clone, Debug, Serialize)]
pub struct CommitReport {
    pub success: bool,
    pub committed_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<CommitError>,
}

impl CommitReport {
    pub fn conflict(&self) -> bool {
        self.errors.iter().any(|e| e.conflict.is_some())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    ApproveAndCommit,
    Reject,
    Discard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkItemStatus {
    Committed,
    Skipped,
    Rejected,
    Discarded,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct BulkItem {
    pub changeset_id: String,
    pub status: BulkItemStatus,
    pub error: Option<String>,
    pub conflict: Option<Conflict>,
}

/// Aggregate outcome of a bulk operation. `conflict` is true when any item
/// hit a version mismatch or a missing entity, so callers can render a
/// 409-equivalent while still reporting the items that did succeed.
#[derive(Clone, Debug, Serialize)]
pub struct BulkReport {
    pub success: bool,
    pub conflict: bool,
    pub items: Vec<BulkItem>,
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
