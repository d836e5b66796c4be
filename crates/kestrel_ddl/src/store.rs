//! SQL-table-backed persistence of DDL jobs and reorg progress handles.
//!
//! Tables:
//! - `kestrel_ddl_job (job_id, reorg, schema_ids, table_ids, job_meta, type, processing)`
//! - `kestrel_ddl_reorg (job_id, ele_id, ele_type, start_key, end_key, physical_id)`
//!
//! Literal conventions: empty byte blobs encode as `''`, non-empty as
//! `0x<hex>`; id-set strings are quoted.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kestrel_common::error::{DdlError, KestrelResult};
use kestrel_common::types::JobId;

use crate::job::{Job, ReorgElement, ReorgHandle};
use crate::pool::WorkerKind;
use crate::session::{DiskFullOpt, SqlRow, SqlSession};

pub const JOB_TABLE: &str = "kestrel_ddl_job";
pub const REORG_TABLE: &str = "kestrel_ddl_reorg";

/// Encode a byte blob as a SQL literal.
pub fn wrap_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "''".into();
    }
    let mut s = String::with_capacity(2 + bytes.len() * 2);
    s.push_str("0x");
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn quote(s: &str) -> String {
    format!("'{s}'")
}

/// Store of durable job rows, bound to one internal session.
pub struct JobStore {
    sess: Arc<dyn SqlSession>,
}

impl JobStore {
    pub fn new(sess: Arc<dyn SqlSession>) -> JobStore {
        JobStore { sess }
    }

    pub fn session(&self) -> &Arc<dyn SqlSession> {
        &self.sess
    }

    /// Insert jobs in one multi-row statement.
    pub async fn insert_jobs(
        &self,
        ctx: &CancellationToken,
        update_raw_args: bool,
        jobs: &[Job],
    ) -> KestrelResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut sql = format!(
            "insert into {JOB_TABLE}(job_id, reorg, schema_ids, table_ids, job_meta, type, processing) values"
        );
        for (i, job) in jobs.iter().enumerate() {
            let meta = job.encode(update_raw_args)?;
            if i != 0 {
                sql.push(',');
            }
            let _ = write!(
                sql,
                "({}, {}, {}, {}, {}, {}, {})",
                job.id.0,
                job.may_need_reorg(),
                quote(&job.schema_ids_str()),
                quote(&job.table_ids_str()),
                wrap_bytes(&meta),
                job.job_type.code(),
                !job.not_started()
            );
        }
        self.sess.set_disk_full_opt(DiskFullOpt::AllowedOnAlmostFull);
        self.sess.execute(ctx, &sql, "insert_job").await?;
        tracing::debug!(sql = %sql, "add job to job table");
        Ok(())
    }

    /// Rewrite the meta blob of a job.
    pub async fn update_job(
        &self,
        ctx: &CancellationToken,
        job: &Job,
        update_raw_args: bool,
    ) -> KestrelResult<()> {
        let meta = job.encode(update_raw_args)?;
        let sql = format!(
            "update {JOB_TABLE} set job_meta = {} where job_id = {}",
            wrap_bytes(&meta),
            job.id.0
        );
        self.sess.execute(ctx, &sql, "update_job").await?;
        Ok(())
    }

    pub async fn delete_job(&self, ctx: &CancellationToken, job_id: JobId) -> KestrelResult<()> {
        let sql = format!("delete from {JOB_TABLE} where job_id = {}", job_id.0);
        self.sess.execute(ctx, &sql, "delete_job").await?;
        Ok(())
    }

    pub async fn mark_processing(
        &self,
        ctx: &CancellationToken,
        job_id: JobId,
    ) -> KestrelResult<()> {
        self.sess.set_disk_full_opt(DiskFullOpt::AllowedOnAlmostFull);
        let sql = format!(
            "update {JOB_TABLE} set processing = 1 where job_id = {}",
            job_id.0
        );
        self.sess.execute(ctx, &sql, "mark_job_processing").await?;
        Ok(())
    }

    pub async fn clear_processing(
        &self,
        ctx: &CancellationToken,
        job_id: JobId,
    ) -> KestrelResult<()> {
        self.sess.set_disk_full_opt(DiskFullOpt::AllowedOnAlmostFull);
        let sql = format!(
            "update {JOB_TABLE} set processing = 0 where job_id = {}",
            job_id.0
        );
        self.sess.execute(ctx, &sql, "clear_job_processing").await?;
        Ok(())
    }

    /// The canonical candidate query: the oldest job per distinct
    /// `(schema_ids, table_ids)` group, filtered to the worker class,
    /// excluding in-flight ids, already-processing rows first then FIFO.
    /// Returns `(job, processing)` pairs.
    pub async fn candidates(
        &self,
        ctx: &CancellationToken,
        tp: WorkerKind,
        exclude: &[JobId],
    ) -> KestrelResult<Vec<(Job, bool)>> {
        let not = match tp {
            WorkerKind::General => "not ",
            WorkerKind::Reorg => "",
        };
        let exclude_clause = if exclude.is_empty() {
            String::new()
        } else {
            let ids: Vec<String> = exclude.iter().map(|id| id.0.to_string()).collect();
            format!(" and job_id not in ({})", ids.join(","))
        };
        let label = match tp {
            WorkerKind::General => "get_job_general",
            WorkerKind::Reorg => "get_job_reorg",
        };
        let sql = format!(
            "select job_meta, processing from {JOB_TABLE} where job_id in \
             (select min(job_id) from {JOB_TABLE} group by schema_ids, table_ids) \
             and {not}reorg{exclude_clause} order by processing desc, job_id"
        );
        let rows = self.sess.execute(ctx, &sql, label).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let meta = row
                .bytes(0)
                .ok_or_else(|| DdlError::Sql("job_meta column missing".into()))?;
            let job = Job::decode(meta)?;
            let processing = row.int(1).unwrap_or(0) == 1;
            out.push((job, processing));
        }
        Ok(out)
    }

    /// Decode every job matching `condition`, e.g. `"1 order by job_id"`.
    pub async fn jobs_where(
        &self,
        ctx: &CancellationToken,
        condition: &str,
    ) -> KestrelResult<Vec<Job>> {
        let sql = format!("select job_meta from {JOB_TABLE} where {condition}");
        let rows = self.sess.execute(ctx, &sql, "get_job").await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let meta = row
                .bytes(0)
                .ok_or_else(|| DdlError::Sql("job_meta column missing".into()))?;
            jobs.push(Job::decode(meta)?);
        }
        Ok(jobs)
    }

    // ── reorg progress handles ──────────────────────────────────────────

    /// Load the reorg handle of `job`. `physical_id = 0` marks rows written
    /// by versions that predate partition support; the end key and physical
    /// id then come from the job body.
    pub async fn reorg_handle(
        &self,
        ctx: &CancellationToken,
        job: &Job,
    ) -> KestrelResult<ReorgHandle> {
        let sql = format!(
            "select ele_id, ele_type, start_key, end_key, physical_id from {REORG_TABLE} \
             where job_id = {}",
            job.id.0
        );
        let rows = self.sess.execute(ctx, &sql, "get_handle").await?;
        let Some(row) = rows.first() else {
            return Err(DdlError::ReorgHandleMissing(job.id).into());
        };
        let mut handle = decode_reorg_row(job.id, row)?;
        if handle.physical_table_id == 0 {
            handle.end_key = match &job.reorg_meta {
                Some(meta) => encode_int_handle(meta.end_handle),
                None => encode_int_handle(i64::MAX),
            };
            handle.physical_table_id = job.table_id.0;
            tracing::warn!(
                physical_table_id = handle.physical_table_id,
                start_key = %wrap_bytes(&handle.start_key),
                end_key = %wrap_bytes(&handle.end_key),
                "running on reorg data written by an old version"
            );
        }
        Ok(handle)
    }

    pub async fn init_reorg_handle(
        &self,
        ctx: &CancellationToken,
        handle: &ReorgHandle,
    ) -> KestrelResult<()> {
        let sql = format!(
            "insert into {REORG_TABLE}(job_id, ele_id, ele_type, start_key, end_key, physical_id) \
             values ({}, {}, {}, {}, {}, {})",
            handle.job_id.0,
            handle.element.id,
            wrap_bytes(&handle.element.type_key),
            wrap_bytes(&handle.start_key),
            wrap_bytes(&handle.end_key),
            handle.physical_table_id
        );
        self.sess.execute(ctx, &sql, "init_handle").await?;
        Ok(())
    }

    pub async fn update_reorg_handle(
        &self,
        ctx: &CancellationToken,
        handle: &ReorgHandle,
    ) -> KestrelResult<()> {
        let sql = format!(
            "update {REORG_TABLE} set ele_id = {}, ele_type = {}, start_key = {}, \
             end_key = {}, physical_id = {} where job_id = {}",
            handle.element.id,
            wrap_bytes(&handle.element.type_key),
            wrap_bytes(&handle.start_key),
            wrap_bytes(&handle.end_key),
            handle.physical_table_id,
            handle.job_id.0
        );
        self.sess.execute(ctx, &sql, "update_handle").await?;
        Ok(())
    }

    /// Advance only the progress cursor.
    pub async fn update_reorg_start_key(
        &self,
        ctx: &CancellationToken,
        job_id: JobId,
        element: &ReorgElement,
        start_key: &[u8],
    ) -> KestrelResult<()> {
        let sql = format!(
            "update {REORG_TABLE} set ele_id = {}, ele_type = {}, start_key = {} where job_id = {}",
            element.id,
            wrap_bytes(&element.type_key),
            wrap_bytes(start_key),
            job_id.0
        );
        self.sess.execute(ctx, &sql, "update_start_handle").await?;
        Ok(())
    }

    pub async fn remove_reorg_handle(
        &self,
        ctx: &CancellationToken,
        job_id: JobId,
    ) -> KestrelResult<()> {
        let sql = format!("delete from {REORG_TABLE} where job_id = {}", job_id.0);
        self.sess.execute(ctx, &sql, "remove_handle").await?;
        Ok(())
    }

    /// All reorg handles, raw. Used by the table→queue migration.
    pub async fn all_reorg_handles(
        &self,
        ctx: &CancellationToken,
    ) -> KestrelResult<Vec<ReorgHandle>> {
        let sql = format!(
            "select job_id, start_key, end_key, physical_id, ele_id, ele_type from {REORG_TABLE}"
        );
        let rows = self.sess.execute(ctx, &sql, "get_handle").await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let col = |idx: usize| -> KestrelResult<Vec<u8>> {
                row.bytes(idx)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| DdlError::Sql(format!("reorg column {idx} missing")).into())
            };
            out.push(ReorgHandle {
                job_id: JobId(row.int(0).unwrap_or(0)),
                start_key: col(1)?,
                end_key: col(2)?,
                physical_table_id: row.int(3).unwrap_or(0),
                element: ReorgElement {
                    id: row.int(4).unwrap_or(0),
                    type_key: col(5)?,
                },
            });
        }
        Ok(out)
    }
}

fn decode_reorg_row(job_id: JobId, row: &SqlRow) -> KestrelResult<ReorgHandle> {
    let col = |idx: usize| -> KestrelResult<Vec<u8>> {
        row.bytes(idx)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| DdlError::Sql(format!("reorg column {idx} missing")).into())
    };
    Ok(ReorgHandle {
        job_id,
        element: ReorgElement {
            id: row.int(0).unwrap_or(0),
            type_key: col(1)?,
        },
        start_key: col(2)?,
        end_key: col(3)?,
        physical_table_id: row.int(4).unwrap_or(0),
    })
}

/// Order-preserving encoding of an integer row handle, used when falling
/// back from legacy reorg rows.
fn encode_int_handle(handle: i64) -> Vec<u8> {
    let encoded = (handle as u64) ^ (1u64 << 63);
    encoded.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_bytes_empty() {
        assert_eq!(wrap_bytes(b""), "''");
    }

    #[test]
    fn test_wrap_bytes_hex() {
        assert_eq!(wrap_bytes(&[0x00, 0xab, 0x10]), "0x00ab10");
    }

    #[test]
    fn test_encode_int_handle_orders() {
        assert!(encode_int_handle(-1) < encode_int_handle(0));
        assert!(encode_int_handle(0) < encode_int_handle(i64::MAX));
    }
}
