//! DDL job scheduling: the durable SQL-backed job queue, the runnability
//! predicates, the owner-elected dispatch loop, and the one-shot migration
//! between the legacy KV queue and the table representation.

pub mod dispatcher;
pub mod job;
pub mod migrate;
pub mod notify;
pub mod pool;
pub mod selector;
pub mod session;
pub mod store;


pub use dispatcher::{
    DispatchHook, Dispatcher, DispatcherDeps, DispatcherHandle, JobHandler, NoopHook,
    OwnerChecker, SchemaSyncer,
};
pub use job::{Job, JobState, JobType, ReorgElement, ReorgHandle};
pub use migrate::{LegacyQueue, MetaStore, MigrationBridge};
pub use notify::{async_notify, JobNotifier, WatchEvent, ADDING_DDL_JOB_KEY};
pub use pool::{Worker, WorkerKind, WorkerPool};
pub use selector::JobSelector;
pub use session::{DiskFullOpt, SessionPool, SqlRow, SqlSession, SqlValue};
pub use store::JobStore;
