//! The session's transaction object.
//!
//! `LazyTxn` wraps the KV transaction behind two services:
//! 1. Statement writes land in a staging frame first, so a failed statement
//!    never dirties the transaction.
//! 2. The transaction starts out as a timestamp future and only becomes a
//!    real KV transaction when first needed.
//!
//! State invariant — exactly one of:
//! - Invalid: `txn == None && future == None`
//! - Pending: `txn == None && future == Some`
//! - Valid:   `txn == Some && future == None`

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use kestrel_common::error::{KestrelError, KestrelResult, TxnError};
use kestrel_common::types::{TableId, Timestamp};
use kestrel_kv::buffer::{BufferCheckpoint, KeyFlags, MemBuffer, StagingHandle};
use kestrel_kv::keycodec;
use kestrel_kv::txn::{Key, KvTransaction, LockCtx, TableInfo};

use crate::future::TxnFuture;
use crate::info::{NoopRecorder, TxnInfo, TxnInfoRecorder, TxnRunningState};
use crate::mutation::{PrewriteValue, TableMutation};

/// Commit-path interception seam. The production policy does nothing; test
/// policies inject retryable errors to exercise the session retry loop.
pub trait CommitInterceptor: Send + Sync {
    fn before_commit(&self) -> KestrelResult<()> {
        Ok(())
    }
}

/// Production interceptor: never interferes.
#[derive(Debug, Default)]
pub struct NoopInterceptor;

impl CommitInterceptor for NoopInterceptor {}

/// Lazy transaction wrapping the KV transaction.
pub struct LazyTxn {
    txn: Option<Box<dyn KvTransaction>>,
    future: Option<TxnFuture>,

    /// Buffer length when the current statement frame was opened.
    init_cnt: usize,
    staging_handle: StagingHandle,
    mutations: HashMap<TableId, TableMutation>,

    /// Observable info, shared with observer sessions. Frequently written,
    /// rarely read; readers copy-on-read.
    mu: Arc<RwLock<TxnInfo>>,
    recorder: Arc<dyn TxnInfoRecorder>,
    interceptor: Arc<dyn CommitInterceptor>,
}

impl Default for LazyTxn {
    fn default() -> Self {
        LazyTxn::new(Arc::new(NoopRecorder), Arc::new(NoopInterceptor))
    }
}

impl LazyTxn {
    pub fn new(
        recorder: Arc<dyn TxnInfoRecorder>,
        interceptor: Arc<dyn CommitInterceptor>,
    ) -> LazyTxn {
        LazyTxn {
            txn: None,
            future: None,
            init_cnt: 0,
            staging_handle: StagingHandle::INVALID,
            mutations: HashMap::new(),
            mu: Arc::new(RwLock::new(TxnInfo::default())),
            recorder,
            interceptor,
        }
    }

    // ── state predicates ────────────────────────────────────────────────

    pub fn valid(&self) -> bool {
        self.txn.as_ref().is_some_and(|t| t.valid())
    }

    pub fn pending(&self) -> bool {
        self.txn.is_none() && self.future.is_some()
    }

    pub fn valid_or_pending(&self) -> bool {
        self.future.is_some() || self.valid()
    }

    pub fn start_ts(&self) -> Timestamp {
        self.txn
            .as_ref()
            .map(|t| t.start_ts())
            .unwrap_or(Timestamp::ZERO)
    }

    pub fn len(&self) -> usize {
        self.txn.as_ref().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> usize {
        self.txn.as_ref().map(|t| t.size()).unwrap_or(0)
    }

    /// Scope tag of the underlying transaction; empty while not started.
    pub fn scope(&self) -> String {
        self.txn
            .as_ref()
            .map(|t| t.scope().to_owned())
            .unwrap_or_default()
    }

    /// Copy-on-read snapshot for observer sessions.
    pub fn info(&self) -> TxnInfo {
        self.mu.read().clone()
    }

    /// Shared handle to the observable info, for the observation table.
    pub fn info_handle(&self) -> Arc<RwLock<TxnInfo>> {
        self.mu.clone()
    }

    // ── state transitions ───────────────────────────────────────────────

    /// Invalid → Pending.
    pub fn change_to_pending(&mut self, future: TxnFuture) {
        self.txn = None;
        self.future = Some(future);
    }

    /// Pending → Valid. Blocks on the timestamp future; on failure the
    /// transaction is left Invalid and the error surfaces.
    pub(crate) async fn change_pending_to_valid(
        &mut self,
        ctx: &CancellationToken,
    ) -> KestrelResult<()> {
        let Some(future) = self.future.take() else {
            return Err(KestrelError::Internal(
                "transaction future is not set".into(),
            ));
        };

        let txn = match future.wait(ctx).await {
            Ok(txn) => txn,
            Err(err) => {
                self.txn = None;
                return Err(err);
            }
        };
        let start_ts = txn.start_ts();
        self.txn = Some(txn);
        self.init_stmt_buf();

        let (len, size) = self.entry_counters();
        let mut info = self.mu.write();
        // The info may already carry the first statement (usually "begin")
        // recorded while pending; keep the digests.
        let current_digest = info.current_sql_digest.take();
        let digests = std::mem::take(&mut info.all_sql_digests);
        info.observe_state_exit();
        if !info.start_ts.is_zero() {
            self.recorder.on_txn_end(&info);
        }
        *info = TxnInfo {
            start_ts,
            state: TxnRunningState::Idle,
            last_state_change: Some(Instant::now()),
            entries_count: len,
            entries_size: size,
            current_sql_digest: current_digest,
            all_sql_digests: digests,
            ..TxnInfo::default()
        };
        kestrel_observability::record_txn_state_entered(TxnRunningState::Idle.as_str());
        Ok(())
    }

    /// Any → Invalid. Clears both slots, tears down the statement frame and
    /// hands the final info snapshot to the recorder.
    fn change_to_invalid(&mut self) {
        if self.staging_handle.is_valid() {
            if let Some(txn) = self.txn.as_mut() {
                let handle = self.staging_handle;
                txn.mem_buffer().cleanup(handle);
            }
        }
        self.staging_handle = StagingHandle::INVALID;
        self.txn = None;
        self.future = None;

        let mut info = self.mu.write();
        info.observe_state_exit();
        if !info.start_ts.is_zero() {
            self.recorder.on_txn_end(&info);
        }
        *info = TxnInfo::default();
    }

    /// Promote a pending transaction; idempotent when already valid. On
    /// future-wait failure the staging state is cleaned and the session's
    /// start timestamp slot is zeroed.
    pub async fn wait(
        &mut self,
        ctx: &CancellationToken,
        session_start_ts: &mut Timestamp,
    ) -> KestrelResult<()> {
        if !self.valid_or_pending() {
            return Err(TxnError::InvalidTransaction.into());
        }
        if self.pending() {
            if let Err(err) = self.change_pending_to_valid(ctx).await {
                tracing::error!(error = %err, "active transaction fail");
                self.cleanup();
                *session_start_ts = Timestamp::ZERO;
                return Err(err);
            }
        }
        Ok(())
    }

    // ── statement buffer lifecycle ──────────────────────────────────────

    fn init_stmt_buf(&mut self) {
        let Some(txn) = self.txn.as_mut() else {
            return;
        };
        let buf = txn.mem_buffer();
        self.init_cnt = buf.len();
        self.staging_handle = buf.staging();
    }

    /// Cheap estimate of how many writes the current statement produced.
    pub fn count_hint(&self) -> usize {
        if !self.staging_handle.is_valid() {
            return 0;
        }
        self.len().saturating_sub(self.init_cnt)
    }

    fn flush_stmt_buf(&mut self) {
        if !self.staging_handle.is_valid() {
            return;
        }
        let Some(txn) = self.txn.as_mut() else {
            return;
        };
        let handle = self.staging_handle;
        let buf = txn.mem_buffer();
        buf.release(handle);
        self.init_cnt = buf.len();
    }

    fn cleanup_stmt_buf(&mut self) {
        if !self.staging_handle.is_valid() {
            return;
        }
        let Some(txn) = self.txn.as_mut() else {
            return;
        };
        let handle = self.staging_handle;
        let buf = txn.mem_buffer();
        buf.cleanup(handle);
        self.init_cnt = buf.len();

        let (len, size) = self.entry_counters();
        let mut info = self.mu.write();
        info.entries_count = len;
        info.entries_size = size;
    }

    fn entry_counters(&self) -> (u64, u64) {
        self.txn
            .as_ref()
            .map(|t| (t.len() as u64, t.size() as u64))
            .unwrap_or((0, 0))
    }

    /// Discard statement state and re-open a fresh frame.
    fn cleanup(&mut self) {
        self.cleanup_stmt_buf();
        self.init_stmt_buf();
        self.mutations.clear();
    }

    fn reset(&mut self) {
        self.cleanup();
        self.change_to_invalid();
    }

    // ── statement hooks ─────────────────────────────────────────────────

    pub fn on_stmt_start(&mut self, current_sql_digest: &str) {
        if current_sql_digest.is_empty() {
            return;
        }
        let mut info = self.mu.write();
        info.transition(TxnRunningState::Running);
        info.push_digest(current_sql_digest);
    }

    pub fn on_stmt_end(&mut self) {
        let mut info = self.mu.write();
        info.current_sql_digest = None;
        info.transition(TxnRunningState::Idle);
    }

    /// Statement commit: flush the frame into the transaction, merge the
    /// binlog mutations into the session prewrite value, and re-open a
    /// fresh frame.
    pub fn stmt_commit(&mut self, prewrite: Option<&mut PrewriteValue>) {
        self.flush_stmt_buf();
        if let Some(pv) = prewrite {
            for delta in self.mutations.values() {
                pv.mutation_for(delta.table_id).merge_from(delta);
            }
        }
        self.cleanup();
    }

    /// Statement rollback: discard the frame and the statement's mutations.
    pub fn stmt_rollback(&mut self) {
        self.cleanup();
    }

    /// The binlog mutation record of `table_id` for the current statement.
    pub fn stmt_mutation(&mut self, table_id: TableId) -> &mut TableMutation {
        self.mutations
            .entry(table_id)
            .or_insert_with(|| TableMutation::new(table_id))
    }

    // ── transaction operations ──────────────────────────────────────────

    /// Commit the transaction. Precondition: every statement's writes were
    /// already flushed (`stmt_commit`) — a non-empty mutations map or a
    /// non-empty statement frame means the session layer skipped a flush,
    /// which is a bug, not user input.
    pub async fn commit(&mut self, ctx: &CancellationToken) -> KestrelResult<()> {
        let result = self.do_commit(ctx).await;
        self.reset();
        result
    }

    async fn do_commit(&mut self, ctx: &CancellationToken) -> KestrelResult<()> {
        if !self.mutations.is_empty() || self.count_hint() != 0 {
            tracing::error!(
                txn = %self,
                staging_handle = %self.staging_handle,
                count_hint = self.count_hint(),
                "statement writes not flushed before commit"
            );
            return Err(TxnError::InvalidTransaction.into());
        }

        self.mu.write().transition(TxnRunningState::Committing);

        self.interceptor.before_commit()?;

        match self.txn.as_mut() {
            Some(txn) => txn.commit(ctx).await,
            None => Err(TxnError::InvalidTransaction.into()),
        }
    }

    /// Roll the transaction back and reset to Invalid.
    pub async fn rollback(&mut self) -> KestrelResult<()> {
        let result = self.do_rollback().await;
        self.reset();
        result
    }

    async fn do_rollback(&mut self) -> KestrelResult<()> {
        self.mu.write().transition(TxnRunningState::RollingBack);
        match self.txn.as_mut() {
            Some(txn) => txn.rollback().await,
            None => Err(TxnError::InvalidTransaction.into()),
        }
    }

    /// Acquire pessimistic locks, exposing the wait through the info state.
    /// This is the one transition that restores the previous state instead
    /// of moving forward.
    pub async fn lock_keys(
        &mut self,
        ctx: &CancellationToken,
        lock_ctx: &LockCtx,
        keys: &[Key],
    ) -> KestrelResult<()> {
        let origin_state = {
            let mut info = self.mu.write();
            let origin = info.state;
            info.transition(TxnRunningState::LockAcquiring);
            info.block_start_time = Some(Instant::now());
            origin
        };

        // The info lock is not held across the KV call.
        let result = match self.txn.as_mut() {
            Some(txn) => txn.lock_keys(ctx, lock_ctx, keys).await,
            None => Err(TxnError::InvalidTransaction.into()),
        };

        let (len, size) = self.entry_counters();
        let mut info = self.mu.write();
        info.transition(origin_state);
        info.block_start_time = None;
        info.entries_count = len;
        info.entries_size = size;
        result
    }

    /// Roll the write buffer back to a savepoint checkpoint.
    pub fn rollback_to_checkpoint(&mut self, cp: BufferCheckpoint) {
        self.flush_stmt_buf();
        if let Some(txn) = self.txn.as_mut() {
            txn.rollback_to_checkpoint(cp);
        }
        self.cleanup();
    }

    /// Keys written by the current statement that need pessimistic locks.
    pub fn keys_need_to_lock(&self) -> Vec<Key> {
        if !self.staging_handle.is_valid() {
            return Vec::new();
        }
        let Some(txn) = self.txn.as_ref() else {
            return Vec::new();
        };
        let mut keys = Vec::with_capacity(self.count_hint());
        txn.mem_buffer_ref()
            .inspect_stage(self.staging_handle, |k, flags, v| {
                if key_needs_lock(k, v, flags) {
                    keys.push(k.to_vec());
                }
            });
        keys
    }

    /// Whether the transaction buffer holds an uncommitted write on
    /// `table_id`. Narrow query used by the session's dirty-read path.
    pub fn has_dirty_content(&self, table_id: TableId) -> bool {
        let Some(txn) = self.txn.as_ref() else {
            return false;
        };
        txn.mem_buffer_ref()
            .has_prefix(&keycodec::encode_table_prefix(table_id))
    }

    // ── delegation ──────────────────────────────────────────────────────

    pub fn mem_buffer(&mut self) -> Option<&mut MemBuffer> {
        self.txn.as_mut().map(|t| t.mem_buffer())
    }

    pub fn table_info(&self, id: TableId) -> Option<Arc<TableInfo>> {
        self.txn.as_ref().and_then(|t| t.table_info(id))
    }

    pub fn cache_table_info(&self, id: TableId, tbl: Arc<TableInfo>) {
        if let Some(txn) = self.txn.as_ref() {
            txn.cache_table_info(id, tbl);
        }
    }
}

impl fmt::Display for LazyTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.pending() {
            write!(f, "Txn{{state=pending}}")
        } else if self.valid() {
            write!(f, "Txn{{state=valid, start_ts={}", self.start_ts())?;
            if !self.mutations.is_empty() {
                write!(f, ", mutation_tables={}", self.mutations.len())?;
            }
            write!(f, "}}")
        } else {
            write!(f, "Txn{{state=invalid}}")
        }
    }
}

impl fmt::Debug for LazyTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Lock-selection rule for one staged write.
///
/// Metadata keys always lock. Table keys lock when the write presumed the
/// key absent, when a delete targets a row or was explicitly marked, for any
/// non-index write carrying a value, and for unique index writes. Untouched
/// index writes and non-unique index writes never lock.
fn key_needs_lock(key: &[u8], value: &[u8], flags: KeyFlags) -> bool {
    if !keycodec::is_table_key(key) {
        return true;
    }
    if flags.has_presume_key_not_exists() {
        return true;
    }

    if value.is_empty() {
        return flags.has_need_locked() || keycodec::is_record_key(key);
    }

    if keycodec::is_untouched_index_kv(key, value) {
        return false;
    }

    if !keycodec::is_index_key(key) {
        return true;
    }

    keycodec::index_value_is_unique(value)
}

#[cfg(test)]
mod key_lock_tests {
    use super::*;
    use kestrel_kv::keycodec::{
        encode_index_key, encode_index_value, encode_record_key, INDEX_VALUE_UNIQUE,
        INDEX_VALUE_UNTOUCHED,
    };

    #[test]
    fn test_meta_key_always_locks() {
        assert!(key_needs_lock(b"mNextGlobalID", b"", KeyFlags::empty()));
    }

    #[test]
    fn test_presume_not_exists_locks() {
        let k = encode_index_key(TableId(1), 2, b"v");
        assert!(key_needs_lock(
            &k,
            b"x",
            KeyFlags::PRESUME_KEY_NOT_EXISTS
        ));
    }

    #[test]
    fn test_delete_record_key_locks() {
        let k = encode_record_key(TableId(1), 5);
        assert!(key_needs_lock(&k, b"", KeyFlags::empty()));
    }

    #[test]
    fn test_delete_index_key_needs_flag() {
        let k = encode_index_key(TableId(1), 2, b"v");
        assert!(!key_needs_lock(&k, b"", KeyFlags::empty()));
        assert!(key_needs_lock(&k, b"", KeyFlags::NEED_LOCKED));
    }

    #[test]
    fn test_untouched_index_never_locks() {
        let k = encode_index_key(TableId(1), 2, b"v");
        let v = encode_index_value(INDEX_VALUE_UNIQUE | INDEX_VALUE_UNTOUCHED, b"h");
        assert!(!key_needs_lock(&k, &v, KeyFlags::empty()));
    }

    #[test]
    fn test_record_key_with_value_locks() {
        let k = encode_record_key(TableId(1), 5);
        assert!(key_needs_lock(&k, b"row", KeyFlags::empty()));
    }

    #[test]
    fn test_unique_index_locks_nonunique_does_not() {
        let k = encode_index_key(TableId(1), 2, b"v");
        let unique = encode_index_value(INDEX_VALUE_UNIQUE, b"h");
        let nonunique = encode_index_value(0, b"h");
        assert!(key_needs_lock(&k, &unique, KeyFlags::empty()));
        assert!(!key_needs_lock(&k, &nonunique, KeyFlags::empty()));
    }
}
