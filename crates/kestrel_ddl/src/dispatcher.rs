//! The DDL job dispatch loop.
//!
//! Runs on the elected cluster owner only. Wakes on local job submission,
//! on the etcd notification key, or on a defensive 1-second poll; each
//! wakeup tries to hand one general and one reorg job to their bounded
//! worker pools. Before a job reaches its handler the loop enforces the
//! schema-sync barrier: every node must have observed the previous schema
//! version, waited up to `2 × lease`.
//!
//! Usage:
//! ```ignore
//! let dispatcher = Arc::new(Dispatcher::new(cfg, deps));
//! let handle = dispatcher.start(shutdown_token.child_token());
//! // ... later ...
//! handle.stop().await;
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kestrel_common::config::{DdlConfig, SyncFailureAction};
use kestrel_common::error::KestrelResult;
use kestrel_common::types::JobId;

use crate::job::Job;
use crate::notify::{async_notify, JobNotifier, ADDING_DDL_JOB_KEY};
use crate::pool::{Worker, WorkerKind, WorkerPool};
use crate::selector::JobSelector;
use crate::session::SessionPool;
use crate::store::JobStore;

/// Owner-election seam; only one node is owner at a time.
pub trait OwnerChecker: Send + Sync {
    fn is_owner(&self) -> bool;
}

/// Schema-version synchronization seam.
#[async_trait]
pub trait SchemaSyncer: Send + Sync {
    /// Whether every node already observed the schema version this job
    /// depends on.
    fn is_synced(&self, job: &Job) -> bool;

    /// Block until every node reports the version, up to `timeout`.
    async fn wait_synced(
        &self,
        ctx: &CancellationToken,
        job: &Job,
        timeout: Duration,
    ) -> KestrelResult<()>;
}

/// The job-executing body. Out of the dispatcher's hands: it mutates schema
/// metadata, advances reorg progress, and deletes the job row when done.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, job: &Job) -> KestrelResult<()>;
}

/// Test/diagnostic interception points around job acquisition.
pub trait DispatchHook: Send + Sync {
    fn on_get_job_before(&self, _kind: WorkerKind) {}
    fn on_get_job_after(&self, _kind: WorkerKind, _job: &Job) {}
}

/// Default hook: does nothing.
#[derive(Debug, Default)]
pub struct NoopHook;

impl DispatchHook for NoopHook {}

/// External collaborators of the dispatcher.
pub struct DispatcherDeps {
    pub owner: Arc<dyn OwnerChecker>,
    pub syncer: Arc<dyn SchemaSyncer>,
    pub notifier: Arc<dyn JobNotifier>,
    pub sessions: Arc<dyn SessionPool>,
    pub handler: Arc<dyn JobHandler>,
    /// Cluster-wide "jobs live in the SQL table" flag; the migration bridge
    /// flips it.
    pub concurrent_ddl: Arc<AtomicBool>,
}

/// Owner-elected DDL job dispatcher.
pub struct Dispatcher {
    cfg: DdlConfig,
    owner: Arc<dyn OwnerChecker>,
    syncer: Arc<dyn SchemaSyncer>,
    notifier: Arc<dyn JobNotifier>,
    sessions: Arc<dyn SessionPool>,
    handler: Arc<dyn JobHandler>,
    concurrent_ddl: Arc<AtomicBool>,

    hook: RwLock<Arc<dyn DispatchHook>>,
    /// Set while the node intentionally pauses dispatch (e.g. upgrade).
    waiting: AtomicBool,
    /// Forces a schema-sync barrier on the next delivery. Set whenever the
    /// loop was gated (ownership lost, dispatch disabled, waiting).
    once: AtomicBool,
    /// Jobs currently assigned to a worker on this owner. Owner-local:
    /// empty on startup by design, since persisted `processing = 1` rows
    /// are exactly those in flight on *some* owner.
    running: Mutex<HashSet<JobId>>,

    general_pool: WorkerPool,
    reorg_pool: WorkerPool,

    job_tx: mpsc::Sender<()>,
    job_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Dispatcher {
    pub fn new(cfg: DdlConfig, deps: DispatcherDeps) -> Dispatcher {
        let (job_tx, job_rx) = mpsc::channel(1);
        Dispatcher {
            cfg,
            owner: deps.owner,
            syncer: deps.syncer,
            notifier: deps.notifier,
            sessions: deps.sessions,
            handler: deps.handler,
            concurrent_ddl: deps.concurrent_ddl,
            hook: RwLock::new(Arc::new(NoopHook)),
            waiting: AtomicBool::new(false),
            once: AtomicBool::new(true),
            running: Mutex::new(HashSet::new()),
            general_pool: WorkerPool::new(WorkerKind::General, 1),
            reorg_pool: WorkerPool::new(WorkerKind::Reorg, 1),
            job_tx,
            job_rx: Mutex::new(Some(job_rx)),
        }
    }

    /// Ping the local wakeup channel. Called by job submitters on this node
    /// after inserting job rows.
    pub fn notify_job_added(&self) {
        async_notify(&self.job_tx);
    }

    pub fn set_hook(&self, hook: Arc<dyn DispatchHook>) {
        *self.hook.write() = hook;
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::SeqCst);
    }

    /// Snapshot of the running-job set, for observability.
    pub fn running_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.running.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Spawn the dispatch loop. `ctx` cancels it.
    pub fn start(self: Arc<Self>, ctx: CancellationToken) -> DispatcherHandle {
        let loop_ctx = ctx.clone();
        let join = tokio::spawn(async move {
            self.run_loop(loop_ctx).await;
        });
        DispatcherHandle {
            cancel: ctx,
            join: Some(join),
        }
    }

    async fn run_loop(self: Arc<Self>, ctx: CancellationToken) {
        let sess = match self.sessions.get().await {
            Ok(sess) => sess,
            Err(err) => {
                tracing::error!(error = %err, "dispatch loop could not get a session; restart the server");
                return;
            }
        };
        let store = JobStore::new(sess.clone());

        let mut job_rx = match self.job_rx.lock().take() {
            Some(rx) => rx,
            None => {
                tracing::error!("dispatch loop started twice");
                return;
            }
        };
        let mut watch_rx = self.notifier.watch(ADDING_DDL_JOB_KEY);
        let mut ticker = tokio::time::interval(self.cfg.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!("ddl dispatch loop starting");
        loop {
            if ctx.is_cancelled() {
                break;
            }
            if !self.concurrent_ddl.load(Ordering::SeqCst)
                || !self.owner.is_owner()
                || self.waiting.load(Ordering::SeqCst)
            {
                self.once.store(true, Ordering::SeqCst);
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.not_owner_backoff()) => {}
                    _ = ctx.cancelled() => break,
                }
                continue;
            }
            tokio::select! {
                _ = job_rx.recv() => {
                    kestrel_observability::record_ddl_wakeup("local");
                }
                _ = ticker.tick() => {
                    kestrel_observability::record_ddl_wakeup("tick");
                }
                event = watch_rx.recv() => {
                    match event {
                        Some(_) => kestrel_observability::record_ddl_wakeup("watch"),
                        None => {
                            tracing::warn!(watch_key = ADDING_DDL_JOB_KEY, "watch channel closed");
                            tokio::select! {
                                _ = tokio::time::sleep(self.cfg.rewatch_backoff()) => {}
                                _ = ctx.cancelled() => break,
                            }
                            watch_rx = self.notifier.watch(ADDING_DDL_JOB_KEY);
                            continue;
                        }
                    }
                }
                _ = ctx.cancelled() => break,
            }
            Self::load_job_and_run(&self, &ctx, &store, WorkerKind::General).await;
            Self::load_job_and_run(&self, &ctx, &store, WorkerKind::Reorg).await;
        }
        tracing::info!("ddl dispatch loop stopped");
        self.sessions.put(sess);
    }

    fn pool(&self, kind: WorkerKind) -> &WorkerPool {
        match kind {
            WorkerKind::General => &self.general_pool,
            WorkerKind::Reorg => &self.reorg_pool,
        }
    }

    fn exclude_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.running.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Acquire a worker, select a job, and deliver it. On no worker, no job
    /// or any error, the worker goes back and the iteration ends.
    async fn load_job_and_run(
        this: &Arc<Self>,
        ctx: &CancellationToken,
        store: &JobStore,
        kind: WorkerKind,
    ) {
        let pool = this.pool(kind);
        let Some(worker) = pool.get() else {
            tracing::debug!(kind = %kind, "no worker available now");
            return;
        };

        this.hook.read().on_get_job_before(kind);

        let exclude = this.exclude_ids();
        let selector = JobSelector::new(store);
        let picked = match kind {
            WorkerKind::General => selector.next_general_job(ctx, &exclude).await,
            WorkerKind::Reorg => selector.next_reorg_job(ctx, &exclude).await,
        };
        let job = match picked {
            Ok(Some(job)) => job,
            Ok(None) => {
                pool.put(worker);
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, kind = %kind, "get job met error");
                pool.put(worker);
                return;
            }
        };

        this.hook.read().on_get_job_after(kind, &job);
        Self::deliver_to_worker(this, ctx, worker, kind, job);
    }

    /// Hand the job to a worker task. The running set gains the id before
    /// the task spawns so the selection exclusion covers it immediately.
    fn deliver_to_worker(
        this: &Arc<Self>,
        ctx: &CancellationToken,
        worker: Worker,
        kind: WorkerKind,
        job: Job,
    ) {
        this.running.lock().insert(job.id);

        let this = this.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            kestrel_observability::record_ddl_running_jobs(kind.as_str(), 1);

            this.run_delivered_job(&ctx, &job).await;

            this.pool(kind).put(worker);
            this.running.lock().remove(&job.id);
            async_notify(&this.job_tx);
            kestrel_observability::record_ddl_running_jobs(kind.as_str(), -1);
        });
    }

    async fn run_delivered_job(&self, ctx: &CancellationToken, job: &Job) {
        // Wait 2 × lease so every server is guaranteed to have finished the
        // previous schema change before this job mutates metadata.
        if !self.syncer.is_synced(job) || self.once.load(Ordering::SeqCst) {
            let timeout = 2 * self.cfg.lease();
            match self.syncer.wait_synced(ctx, job, timeout).await {
                Ok(()) => {
                    self.once.store(false, Ordering::SeqCst);
                    kestrel_observability::record_ddl_schema_sync("ok");
                }
                Err(err) => {
                    kestrel_observability::record_ddl_schema_sync("timeout");
                    tracing::warn!(error = %err, job = %job, "wait ddl job sync failed");
                    self.on_sync_failure(ctx, job).await;
                    // The job row keeps whatever processing mark the policy
                    // chose; the next dispatch tick retries it.
                    return;
                }
            }
        }

        if let Err(err) = self.handler.handle(ctx, job).await {
            tracing::info!(error = %err, job = %job, "handle ddl job failed");
        }
    }

    async fn on_sync_failure(&self, ctx: &CancellationToken, job: &Job) {
        if self.cfg.sync_failure.on_failure == SyncFailureAction::ClearProcessing {
            match self.sessions.get().await {
                Ok(sess) => {
                    let store = JobStore::new(sess.clone());
                    if let Err(err) = store.clear_processing(ctx, job.id).await {
                        tracing::warn!(error = %err, job = %job, "clear processing failed");
                    }
                    self.sessions.put(sess);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "no session to clear processing mark");
                }
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(self.cfg.sync_failure.retry_delay()) => {}
            _ = ctx.cancelled() => {}
        }
    }
}

/// Handle returned by `Dispatcher::start`.
pub struct DispatcherHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal the loop to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Signal the loop to stop without waiting.
    pub fn signal_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }
}
