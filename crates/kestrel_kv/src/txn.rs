//! Narrow traits behind which the real KV client, the storage engine and
//! the timestamp oracle live. The session transaction core only ever talks
//! to these; concrete implementations (distributed client, in-memory engine)
//! are provided elsewhere.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use kestrel_common::error::KestrelResult;
use kestrel_common::types::{TableId, Timestamp};

use crate::buffer::{BufferCheckpoint, MemBuffer};

/// A KV key.
pub type Key = Vec<u8>;

/// Kind of the backing store. Drives the timestamp-failure retry policy:
/// an in-memory store surfaces the error, a distributed store retries
/// `begin` without a pre-fetched timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    InMemory,
    Distributed,
}

/// Options for starting a transaction.
#[derive(Debug, Clone, Default)]
pub struct BeginOptions {
    /// Scope tag ("global" or a zone label).
    pub txn_scope: String,
    /// Pre-fetched start timestamp; `None` lets the store fetch one itself.
    pub start_ts: Option<Timestamp>,
}

/// Context for a pessimistic lock request.
#[derive(Debug, Clone, Default)]
pub struct LockCtx {
    pub for_update_ts: Timestamp,
    pub lock_wait: Option<Duration>,
}

/// Cached table metadata attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub id: TableId,
    pub name: String,
}

/// Concurrent table-info cache shared by transaction implementations.
/// Read-mostly: populated once per table, read on every row codec call.
#[derive(Debug, Default)]
pub struct TableInfoCache {
    inner: DashMap<TableId, Arc<TableInfo>>,
}

impl TableInfoCache {
    pub fn new() -> TableInfoCache {
        TableInfoCache::default()
    }

    pub fn get(&self, id: TableId) -> Option<Arc<TableInfo>> {
        self.inner.get(&id).map(|e| e.value().clone())
    }

    pub fn put(&self, id: TableId, info: Arc<TableInfo>) {
        self.inner.insert(id, info);
    }
}

/// The transaction surface the session core delegates to. Only the
/// documented methods are forwarded; everything else the underlying client
/// may offer stays invisible to the session.
#[async_trait]
pub trait KvTransaction: Send {
    fn start_ts(&self) -> Timestamp;

    fn valid(&self) -> bool;

    /// Number of buffered writes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffered bytes.
    fn size(&self) -> usize;

    fn mem_buffer(&mut self) -> &mut MemBuffer;

    fn mem_buffer_ref(&self) -> &MemBuffer;

    async fn commit(&mut self, ctx: &CancellationToken) -> KestrelResult<()>;

    async fn rollback(&mut self) -> KestrelResult<()>;

    /// Acquire pessimistic locks; may block on remote lock resolution.
    async fn lock_keys(
        &mut self,
        ctx: &CancellationToken,
        lock_ctx: &LockCtx,
        keys: &[Key],
    ) -> KestrelResult<()>;

    /// Roll the write buffer back to a savepoint checkpoint.
    fn rollback_to_checkpoint(&mut self, cp: BufferCheckpoint);

    fn table_info(&self, id: TableId) -> Option<Arc<TableInfo>>;

    fn cache_table_info(&self, id: TableId, info: Arc<TableInfo>);

    /// Scope tag this transaction was started with.
    fn scope(&self) -> &str;
}

/// The storage engine / KV client seam.
#[async_trait]
pub trait Storage: Send + Sync {
    fn kind(&self) -> StoreKind;

    async fn begin(&self, opts: BeginOptions) -> KestrelResult<Box<dyn KvTransaction>>;
}

/// One-shot promise for a start timestamp from the oracle.
#[async_trait]
pub trait TsFuture: Send {
    async fn wait(self: Box<Self>, ctx: &CancellationToken) -> KestrelResult<Timestamp>;
}
