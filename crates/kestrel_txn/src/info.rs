//! Observable runtime state of a transaction.
//!
//! The data is frequently modified but rarely read: other sessions query it
//! through the cluster "transactions" observation table. It sits behind a
//! reader-writer lock owned by the `LazyTxn`; readers copy-on-read, writers
//! take the write lock. The lock is never held across KV calls.

use std::time::Instant;

use kestrel_common::types::Timestamp;

/// Cap on the per-transaction SQL digest history. Once full, new digests
/// are dropped; entries are never evicted, so consumers see a stable prefix.
pub const MAX_STMT_DIGEST_HISTORY: usize = 50;

/// Runtime state of a transaction as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnRunningState {
    #[default]
    Idle,
    Running,
    LockAcquiring,
    Committing,
    RollingBack,
}

impl TxnRunningState {
    pub fn as_str(self) -> &'static str {
        match self {
            TxnRunningState::Idle => "idle",
            TxnRunningState::Running => "running",
            TxnRunningState::LockAcquiring => "lock_acquiring",
            TxnRunningState::Committing => "committing",
            TxnRunningState::RollingBack => "rolling_back",
        }
    }
}

/// Observable snapshot of a transaction.
#[derive(Debug, Clone, Default)]
pub struct TxnInfo {
    pub start_ts: Timestamp,
    pub state: TxnRunningState,
    pub last_state_change: Option<Instant>,
    /// Set while the transaction is blocked waiting for locks.
    pub block_start_time: Option<Instant>,
    pub entries_count: u64,
    pub entries_size: u64,
    pub current_sql_digest: Option<String>,
    /// At most `MAX_STMT_DIGEST_HISTORY` entries, oldest first.
    pub all_sql_digests: Vec<String>,
}

impl TxnInfo {
    /// Move to `state`, emitting a duration sample for the state being left
    /// and an entering counter for the new one. Re-entering the current
    /// state is a no-op. Call with the write lock held.
    pub fn transition(&mut self, state: TxnRunningState) {
        if self.state == state {
            return;
        }
        self.observe_state_exit();
        self.state = state;
        self.last_state_change = Some(Instant::now());
        kestrel_observability::record_txn_state_entered(state.as_str());
    }

    /// Emit the duration sample for the state currently being left. Used by
    /// `transition` and by the final teardown when the info is cleared.
    pub fn observe_state_exit(&self) {
        if let Some(changed) = self.last_state_change {
            kestrel_observability::record_txn_state_duration(
                self.state.as_str(),
                self.block_start_time.is_some(),
                changed.elapsed().as_secs_f64(),
            );
        }
    }

    /// Record the digest of the statement that just started. The history is
    /// bounded: beyond the cap new digests are dropped, never evicted.
    pub fn push_digest(&mut self, digest: &str) {
        self.current_sql_digest = Some(digest.to_owned());
        if self.all_sql_digests.len() < MAX_STMT_DIGEST_HISTORY {
            self.all_sql_digests.push(digest.to_owned());
        }
    }
}

/// End-of-transaction hook: the info snapshot of every transaction that had
/// a start timestamp is handed here (the observation-table recorder in
/// production, assertions in tests).
pub trait TxnInfoRecorder: Send + Sync {
    fn on_txn_end(&self, info: &TxnInfo);
}

/// Recorder that drops every snapshot.
#[derive(Debug, Default)]
pub struct NoopRecorder;

impl TxnInfoRecorder for NoopRecorder {
    fn on_txn_end(&self, _info: &TxnInfo) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_is_noop_on_same_state() {
        let mut info = TxnInfo::default();
        info.transition(TxnRunningState::Running);
        let changed = info.last_state_change;
        info.transition(TxnRunningState::Running);
        assert_eq!(info.last_state_change, changed);
    }

    #[test]
    fn test_transition_updates_change_time() {
        let mut info = TxnInfo::default();
        assert!(info.last_state_change.is_none());
        info.transition(TxnRunningState::Running);
        assert!(info.last_state_change.is_some());
        assert_eq!(info.state, TxnRunningState::Running);
    }

    #[test]
    fn test_digest_history_drop_new_policy() {
        let mut info = TxnInfo::default();
        for i in 0..60 {
            info.push_digest(&format!("digest-{i}"));
        }
        assert_eq!(info.all_sql_digests.len(), MAX_STMT_DIGEST_HISTORY);
        assert_eq!(info.all_sql_digests[0], "digest-0");
        assert_eq!(info.all_sql_digests[49], "digest-49");
        // The current digest still tracks the latest statement.
        assert_eq!(info.current_sql_digest.as_deref(), Some("digest-59"));
    }
}
