//! One-shot migration between the legacy in-KV job queues and the SQL table
//! representation. Invoked only at bootstrap (queue → table) or on
//! downgrade (table → queue); both directions run inside one transaction
//! and roll back entirely on any error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use kestrel_common::error::KestrelResult;
use kestrel_common::types::SchemaId;

use crate::job::{Job, ReorgHandle};
use crate::session::{SessionPool, SqlSession};
use crate::store::JobStore;

/// The two legacy KV job list keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyQueue {
    /// General jobs.
    Default,
    /// Reorganization jobs (historically "add index").
    AddIndex,
}

/// Legacy meta layer: the in-KV job queues, reorg handles and the flag
/// selecting the table-backed representation.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn is_table_backed(&self) -> KestrelResult<bool>;

    async fn set_table_backed(&self, on: bool) -> KestrelResult<()>;

    async fn system_schema_id(&self) -> KestrelResult<SchemaId>;

    async fn jobs_in_queue(&self, queue: LegacyQueue) -> KestrelResult<Vec<Job>>;

    /// Enqueue without touching the job body (the meta blob is already
    /// canonical).
    async fn enqueue(&self, queue: LegacyQueue, job: &Job) -> KestrelResult<()>;

    /// `None` when the job has no reorg progress recorded.
    async fn reorg_handle(&self, job: &Job) -> KestrelResult<Option<ReorgHandle>>;

    async fn update_reorg_handle(&self, handle: &ReorgHandle) -> KestrelResult<()>;

    async fn clear_all_jobs(&self) -> KestrelResult<()>;

    async fn clear_all_reorg_handles(&self) -> KestrelResult<()>;
}

/// Mover between the two job-queue representations.
pub struct MigrationBridge {
    sessions: Arc<dyn SessionPool>,
    meta: Arc<dyn MetaStore>,
    /// In-process mirror of the table-backed flag, read by the dispatcher.
    concurrent_ddl: Arc<AtomicBool>,
}

impl MigrationBridge {
    pub fn new(
        sessions: Arc<dyn SessionPool>,
        meta: Arc<dyn MetaStore>,
        concurrent_ddl: Arc<AtomicBool>,
    ) -> MigrationBridge {
        MigrationBridge {
            sessions,
            meta,
            concurrent_ddl,
        }
    }

    /// Move every queued legacy job into the SQL table, copy reorg handles,
    /// clear both queues and set the table-backed flag. During bootstrap,
    /// system-schema jobs are internal and skipped.
    pub async fn queue_to_table(
        &self,
        ctx: &CancellationToken,
        in_bootstrap: bool,
    ) -> KestrelResult<()> {
        let sess = self.sessions.get().await?;
        let store = JobStore::new(sess.clone());

        sess.begin(ctx).await?;
        let result = match self.queue_to_table_inner(ctx, &store, in_bootstrap).await {
            Ok(()) => sess.commit(ctx).await,
            Err(err) => {
                if let Err(rb) = sess.rollback().await {
                    tracing::warn!(error = %rb, "migration rollback failed");
                }
                Err(err)
            }
        };
        self.sessions.put(sess);

        if result.is_ok() {
            self.concurrent_ddl.store(true, Ordering::SeqCst);
            tracing::info!("ddl jobs moved from legacy queue to table");
        }
        result
    }

    async fn queue_to_table_inner(
        &self,
        ctx: &CancellationToken,
        store: &JobStore,
        in_bootstrap: bool,
    ) -> KestrelResult<()> {
        if !in_bootstrap && self.meta.is_table_backed().await? {
            return Ok(());
        }
        let system_schema = self.meta.system_schema_id().await?;
        for queue in [LegacyQueue::AddIndex, LegacyQueue::Default] {
            for job in self.meta.jobs_in_queue(queue).await? {
                if in_bootstrap && job.schema_id == system_schema {
                    continue;
                }
                store
                    .insert_jobs(ctx, false, std::slice::from_ref(&job))
                    .await?;
                if queue == LegacyQueue::Default {
                    // General jobs carry no reorg progress.
                    continue;
                }
                if let Some(handle) = self.meta.reorg_handle(&job).await? {
                    store.init_reorg_handle(ctx, &handle).await?;
                }
            }
        }
        self.meta.clear_all_jobs().await?;
        self.meta.clear_all_reorg_handles().await?;
        self.meta.set_table_backed(true).await
    }

    /// The inverse: drain the table back into the legacy queues in job-id
    /// order, restore reorg handles, empty both tables and clear the flag.
    pub async fn table_to_queue(&self, ctx: &CancellationToken) -> KestrelResult<()> {
        let sess = self.sessions.get().await?;
        let store = JobStore::new(sess.clone());

        sess.begin(ctx).await?;
        let result = match self.table_to_queue_inner(ctx, &store).await {
            Ok(()) => sess.commit(ctx).await,
            Err(err) => {
                if let Err(rb) = sess.rollback().await {
                    tracing::warn!(error = %rb, "migration rollback failed");
                }
                Err(err)
            }
        };
        self.sessions.put(sess);

        if result.is_ok() {
            self.concurrent_ddl.store(false, Ordering::SeqCst);
            tracing::info!("ddl jobs moved from table back to legacy queue");
        }
        result
    }

    async fn table_to_queue_inner(
        &self,
        ctx: &CancellationToken,
        store: &JobStore,
    ) -> KestrelResult<()> {
        if !self.meta.is_table_backed().await? {
            return Ok(());
        }
        let jobs = store.jobs_where(ctx, "1 order by job_id").await?;
        for job in &jobs {
            let queue = if job.may_need_reorg() {
                LegacyQueue::AddIndex
            } else {
                LegacyQueue::Default
            };
            self.meta.enqueue(queue, job).await?;
        }
        for handle in store.all_reorg_handles(ctx).await? {
            self.meta.update_reorg_handle(&handle).await?;
        }
        store
            .session()
            .execute(ctx, "delete from kestrel_ddl_job", "delete_old_ddl")
            .await?;
        store
            .session()
            .execute(ctx, "delete from kestrel_ddl_reorg", "delete_old_reorg")
            .await?;
        self.meta.set_table_backed(false).await
    }
}
