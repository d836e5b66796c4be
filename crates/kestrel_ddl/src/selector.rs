//! Runnability predicates and candidate selection.
//!
//! The selector never looks inside job bodies; it reasons purely over the
//! canonical `schema_ids` / `table_ids` row columns, with `find_in_set` as
//! the store's ID-set membership primitive.

use tokio_util::sync::CancellationToken;

use kestrel_common::error::KestrelResult;
use kestrel_common::types::JobId;

use crate::job::{Job, JobType};
use crate::pool::WorkerKind;
use crate::store::{JobStore, JOB_TABLE};

pub struct JobSelector<'a> {
    store: &'a JobStore,
}

impl<'a> JobSelector<'a> {
    pub fn new(store: &'a JobStore) -> JobSelector<'a> {
        JobSelector { store }
    }

    /// Pick the next runnable general job and mark it processing.
    pub async fn next_general_job(
        &self,
        ctx: &CancellationToken,
        exclude: &[JobId],
    ) -> KestrelResult<Option<Job>> {
        self.next_job(ctx, WorkerKind::General, exclude).await
    }

    /// Pick the next runnable reorg job and mark it processing.
    pub async fn next_reorg_job(
        &self,
        ctx: &CancellationToken,
        exclude: &[JobId],
    ) -> KestrelResult<Option<Job>> {
        self.next_job(ctx, WorkerKind::Reorg, exclude).await
    }

    async fn next_job(
        &self,
        ctx: &CancellationToken,
        tp: WorkerKind,
        exclude: &[JobId],
    ) -> KestrelResult<Option<Job>> {
        let candidates = self.store.candidates(ctx, tp, exclude).await?;
        for (job, processing) in candidates {
            // A row already marked processing was in flight on some owner
            // when it crashed or lost ownership; re-pick it unconditionally.
            if processing {
                return Ok(Some(job));
            }
            let runnable = match tp {
                WorkerKind::General => self.general_runnable(ctx, &job).await?,
                WorkerKind::Reorg => self.reorg_runnable(ctx, &job).await?,
            };
            if runnable {
                if let Err(err) = self.store.mark_processing(ctx, job.id).await {
                    tracing::warn!(error = %err, job = %job, "mark job processing failed");
                    return Err(err);
                }
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Whether a general candidate may run now: no processing row races on
    /// its schema (DropSchema) or tables (everything else).
    pub async fn general_runnable(
        &self,
        ctx: &CancellationToken,
        job: &Job,
    ) -> KestrelResult<bool> {
        if job.job_type == JobType::DropSchema {
            let sql = format!(
                "select job_id from {JOB_TABLE} where find_in_set('{}', schema_ids) != 0 \
                 and processing limit 1",
                job.schema_id.0
            );
            return self.check_runnable(ctx, &sql).await;
        }
        // The general worker class is single-threaded, so any in-flight
        // general job has a singleton table_ids; the processing rows this
        // query sees can only be reorg singletons or that one general job.
        // find_in_set therefore suffices. If pool cardinality ever grows,
        // switch to job::id_sets_overlap.
        let sql = format!(
            "select job_id from {JOB_TABLE} t1, (select table_ids from {JOB_TABLE} \
             where job_id = {}) t2 where processing and find_in_set(t1.table_ids, t2.table_ids) != 0",
            job.id.0
        );
        self.check_runnable(ctx, &sql).await
    }

    /// Whether a reorg candidate may run now: no processing DropSchema on
    /// its schema and no processing row on its table.
    pub async fn reorg_runnable(&self, ctx: &CancellationToken, job: &Job) -> KestrelResult<bool> {
        let sql = format!(
            "select job_id from {JOB_TABLE} where (find_in_set('{}', schema_ids) != 0 \
             and type = {} and processing) or (find_in_set('{}', table_ids) != 0 and processing) \
             limit 1",
            job.schema_id.0,
            JobType::DropSchema.code(),
            job.table_id.0
        );
        self.check_runnable(ctx, &sql).await
    }

    async fn check_runnable(&self, ctx: &CancellationToken, sql: &str) -> KestrelResult<bool> {
        let rows = self
            .store
            .session()
            .execute(ctx, sql, "check_runnable")
            .await?;
        Ok(rows.is_empty())
    }
}
