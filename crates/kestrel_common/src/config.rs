use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a job whose schema-sync barrier timed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFailureAction {
    /// Keep the row `processing = 1`. Selection ordering puts it first on
    /// the next dispatch tick, so the same owner re-picks it immediately.
    #[default]
    LeaveProcessing,
    /// Reset the row to `processing = 0`; the job re-enters FIFO order.
    ClearProcessing,
}

/// Policy applied when a delivered job fails its schema-sync barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFailurePolicy {
    pub on_failure: SyncFailureAction,
    /// Sleep before releasing the worker, so a persistently lagging node
    /// does not spin the dispatch loop.
    #[serde(default = "default_sync_retry_ms")]
    pub retry_delay_ms: u64,
}

impl SyncFailurePolicy {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for SyncFailurePolicy {
    fn default() -> Self {
        Self {
            on_failure: SyncFailureAction::LeaveProcessing,
            retry_delay_ms: default_sync_retry_ms(),
        }
    }
}

fn default_sync_retry_ms() -> u64 {
    1_000
}

/// DDL dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlConfig {
    /// Cluster schema lease in milliseconds. The schema-sync barrier waits
    /// up to `2 × lease` for every node to report the new version.
    pub lease_ms: u64,
    /// Defensive poll interval; covers missed notifications.
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    /// Back-off after the etcd watch channel closes before rewatching.
    #[serde(default = "default_backoff_ms")]
    pub rewatch_backoff_ms: u64,
    /// Sleep while not owner / concurrent DDL disabled / waiting.
    #[serde(default = "default_backoff_ms")]
    pub not_owner_backoff_ms: u64,
    #[serde(default)]
    pub sync_failure: SyncFailurePolicy,
}

impl DdlConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn rewatch_backoff(&self) -> Duration {
        Duration::from_millis(self.rewatch_backoff_ms)
    }

    pub fn not_owner_backoff(&self) -> Duration {
        Duration::from_millis(self.not_owner_backoff_ms)
    }
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            lease_ms: 45_000,
            poll_interval_ms: default_poll_ms(),
            rewatch_backoff_ms: default_backoff_ms(),
            not_owner_backoff_ms: default_backoff_ms(),
            sync_failure: SyncFailurePolicy::default(),
        }
    }
}

fn default_poll_ms() -> u64 {
    1_000
}

fn default_backoff_ms() -> u64 {
    1_000
}

/// Session transaction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// Scope tag forwarded to `Storage::begin` (e.g. "global" or a zone).
    #[serde(default = "default_txn_scope")]
    pub txn_scope: String,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            txn_scope: default_txn_scope(),
        }
    }
}

fn default_txn_scope() -> String {
    "global".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_config_defaults() {
        let cfg = DdlConfig::default();
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.rewatch_backoff(), Duration::from_secs(1));
        assert_eq!(
            cfg.sync_failure.on_failure,
            SyncFailureAction::LeaveProcessing
        );
    }

    #[test]
    fn test_ddl_config_deserializes_with_defaults() {
        let cfg: DdlConfig = serde_json::from_str(r#"{"lease_ms": 10000}"#).unwrap();
        assert_eq!(cfg.lease(), Duration::from_secs(10));
        assert_eq!(cfg.poll_interval_ms, 1_000);
        assert_eq!(cfg.sync_failure.retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_sync_failure_action_parses() {
        let p: SyncFailurePolicy =
            serde_json::from_str(r#"{"on_failure": "clear_processing"}"#).unwrap();
        assert_eq!(p.on_failure, SyncFailureAction::ClearProcessing);
    }
}
