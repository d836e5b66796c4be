//! The durable DDL job record and its canonical encodings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kestrel_common::error::DdlError;
use kestrel_common::types::{JobId, SchemaId, TableId};

/// Kind of schema change a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    TruncateTable,
    AddIndex,
    DropIndex,
    ModifyColumn,
    ExchangePartition,
    RenameTable,
    RenameTables,
}

impl JobType {
    /// Stable integer code stored in the job table's `type` column.
    pub fn code(self) -> i64 {
        match self {
            JobType::CreateSchema => 1,
            JobType::DropSchema => 2,
            JobType::CreateTable => 3,
            JobType::DropTable => 4,
            JobType::TruncateTable => 5,
            JobType::AddIndex => 6,
            JobType::DropIndex => 7,
            JobType::ModifyColumn => 8,
            JobType::ExchangePartition => 9,
            JobType::RenameTable => 10,
            JobType::RenameTables => 11,
        }
    }

    pub fn from_code(code: i64) -> Option<JobType> {
        Some(match code {
            1 => JobType::CreateSchema,
            2 => JobType::DropSchema,
            3 => JobType::CreateTable,
            4 => JobType::DropTable,
            5 => JobType::TruncateTable,
            6 => JobType::AddIndex,
            7 => JobType::DropIndex,
            8 => JobType::ModifyColumn,
            9 => JobType::ExchangePartition,
            10 => JobType::RenameTable,
            11 => JobType::RenameTables,
            _ => return None,
        })
    }

    /// Whether jobs of this type run as resumable reorganizations.
    pub fn may_need_reorg(self) -> bool {
        matches!(self, JobType::AddIndex | JobType::ModifyColumn)
    }

    /// Whether the schema/table id sets come from the job's context
    /// variables instead of the singleton ids.
    pub fn is_multi_target(self) -> bool {
        matches!(
            self,
            JobType::ExchangePartition | JobType::RenameTable | JobType::RenameTables
        )
    }
}

/// Lifecycle state of a job. Only the early states matter to the dispatcher;
/// the executors own the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JobState {
    #[default]
    None,
    Queueing,
    Running,
    RollingBack,
    Done,
    Cancelled,
}

/// Reorg progress metadata kept inside the job body by older versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorgMeta {
    pub end_handle: i64,
}

/// A durable schema-change job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub schema_id: SchemaId,
    pub table_id: TableId,
    pub schema_name: String,
    pub state: JobState,
    /// Typed arguments of the schema change.
    pub args: Vec<Value>,
    /// Raw argument bytes as last persisted; refreshed from `args` when a
    /// caller encodes with `update_raw_args`.
    #[serde(default)]
    pub raw_args: Value,
    #[serde(default)]
    pub reorg_meta: Option<ReorgMeta>,
    /// Schema ids involved by multi-target types. In-memory only.
    #[serde(skip)]
    pub ctx_schema_ids: Vec<i64>,
    /// Table ids involved by multi-target types. In-memory only.
    #[serde(skip)]
    pub ctx_table_ids: Vec<i64>,
}

impl Job {
    pub fn new(id: JobId, job_type: JobType, schema_id: SchemaId, table_id: TableId) -> Job {
        Job {
            id,
            job_type,
            schema_id,
            table_id,
            schema_name: String::new(),
            state: JobState::Queueing,
            args: Vec::new(),
            raw_args: Value::Null,
            reorg_meta: None,
            ctx_schema_ids: Vec::new(),
            ctx_table_ids: Vec::new(),
        }
    }

    /// True until a worker picks the job up for the first time.
    pub fn not_started(&self) -> bool {
        matches!(self.state, JobState::None | JobState::Queueing)
    }

    pub fn may_need_reorg(&self) -> bool {
        self.job_type.may_need_reorg()
    }

    /// Serialize the job body. With `update_raw_args` the raw argument
    /// bytes are refreshed from the typed arguments first.
    pub fn encode(&self, update_raw_args: bool) -> Result<Vec<u8>, DdlError> {
        if update_raw_args {
            let mut job = self.clone();
            job.raw_args = Value::Array(job.args.clone());
            return serde_json::to_vec(&job).map_err(|e| DdlError::Codec(e.to_string()));
        }
        serde_json::to_vec(self).map_err(|e| DdlError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Job, DdlError> {
        serde_json::from_slice(bytes).map_err(|e| DdlError::Codec(e.to_string()))
    }

    /// Canonical schema-id set for the job table row.
    pub fn schema_ids_str(&self) -> String {
        if self.job_type.is_multi_target() {
            return canonical_id_set(&self.ctx_schema_ids);
        }
        self.schema_id.0.to_string()
    }

    /// Canonical table-id set for the job table row.
    pub fn table_ids_str(&self) -> String {
        if self.job_type.is_multi_target() {
            return canonical_id_set(&self.ctx_table_ids);
        }
        self.table_id.0.to_string()
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, type {:?}, state {:?}, schema {}, table {}",
            self.id, self.job_type, self.state, self.schema_id, self.table_id
        )
    }
}

/// Dedup and numerically sort `ids`, then comma-join.
pub fn canonical_id_set(ids: &[i64]) -> String {
    let mut ids = ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Re-canonicalize a comma-joined id string. Non-numeric fragments are
/// dropped.
pub fn canonicalize(s: &str) -> String {
    let ids: Vec<i64> = s.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    canonical_id_set(&ids)
}

/// Proper set intersection over two canonical id strings. The runnable SQL
/// uses `find_in_set`, which only handles a singleton needle; this helper is
/// the full check for when worker-pool cardinalities grow past one.
pub fn id_sets_overlap(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    let rhs: std::collections::HashSet<&str> = b.split(',').collect();
    a.split(',').any(|id| rhs.contains(id))
}

/// Progress element of a reorganization (the index or column being built).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgElement {
    pub id: i64,
    pub type_key: Vec<u8>,
}

/// Resumable progress cursor of a reorg job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorgHandle {
    pub job_id: JobId,
    pub element: ReorgElement,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    /// 0 is the legacy marker: older versions did not store it, and the
    /// reader falls back to the job body.
    pub physical_table_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_id_set_sorts_numerically() {
        assert_eq!(canonical_id_set(&[10, 2, 33, 2]), "2,10,33");
        assert_eq!(canonical_id_set(&[]), "");
        assert_eq!(canonical_id_set(&[-5, 3]), "-5,3");
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let once = canonicalize("33,2,10,2");
        assert_eq!(once, "2,10,33");
        assert_eq!(canonicalize(&once), once);
    }

    #[test]
    fn test_id_sets_overlap() {
        assert!(id_sets_overlap("1,2,3", "3,4"));
        assert!(!id_sets_overlap("1,2", "3,4"));
        assert!(!id_sets_overlap("", "1"));
        // The case find_in_set cannot answer: multi-id needle.
        assert!(id_sets_overlap("1,2", "2,5"));
    }

    #[test]
    fn test_singleton_ids_for_plain_types() {
        let job = Job::new(JobId(1), JobType::CreateTable, SchemaId(3), TableId(7));
        assert_eq!(job.schema_ids_str(), "3");
        assert_eq!(job.table_ids_str(), "7");
    }

    #[test]
    fn test_ctx_ids_for_multi_target_types() {
        let mut job = Job::new(JobId(1), JobType::RenameTables, SchemaId(3), TableId(7));
        job.ctx_schema_ids = vec![4, 3, 4];
        job.ctx_table_ids = vec![9, 7, 8, 9];
        assert_eq!(job.schema_ids_str(), "3,4");
        assert_eq!(job.table_ids_str(), "7,8,9");
    }

    #[test]
    fn test_encode_decode_roundtrip_is_byte_identical() {
        let mut job = Job::new(JobId(11), JobType::AddIndex, SchemaId(2), TableId(5));
        job.schema_name = "test".into();
        job.args = vec![serde_json::json!({"index": "idx_a"})];

        let first = job.encode(true).unwrap();
        let decoded = Job::decode(&first).unwrap();
        let second = decoded.encode(false).unwrap();
        assert_eq!(first, second);
        // Raw args were refreshed from the typed args.
        assert_eq!(decoded.raw_args, Value::Array(job.args.clone()));
    }

    #[test]
    fn test_encode_without_update_keeps_raw_args() {
        let mut job = Job::new(JobId(1), JobType::CreateTable, SchemaId(1), TableId(1));
        job.raw_args = serde_json::json!(["stale"]);
        job.args = vec![serde_json::json!("fresh")];
        let bytes = job.encode(false).unwrap();
        let decoded = Job::decode(&bytes).unwrap();
        assert_eq!(decoded.raw_args, serde_json::json!(["stale"]));
    }

    #[test]
    fn test_not_started() {
        let mut job = Job::new(JobId(1), JobType::CreateTable, SchemaId(1), TableId(1));
        assert!(job.not_started());
        job.state = JobState::Running;
        assert!(!job.not_started());
    }

    #[test]
    fn test_reorg_classification() {
        assert!(JobType::AddIndex.may_need_reorg());
        assert!(JobType::ModifyColumn.may_need_reorg());
        assert!(!JobType::CreateTable.may_need_reorg());
        assert!(!JobType::DropSchema.may_need_reorg());
    }

    #[test]
    fn test_type_codes_roundtrip() {
        for tp in [
            JobType::CreateSchema,
            JobType::DropSchema,
            JobType::CreateTable,
            JobType::DropTable,
            JobType::TruncateTable,
            JobType::AddIndex,
            JobType::DropIndex,
            JobType::ModifyColumn,
            JobType::ExchangePartition,
            JobType::RenameTable,
            JobType::RenameTables,
        ] {
            assert_eq!(JobType::from_code(tp.code()), Some(tp));
        }
        assert_eq!(JobType::from_code(0), None);
    }
}
