//! Cross-node and local job-submission wakeups.

use tokio::sync::mpsc;

/// Etcd key watched for cross-node job submission. Any write is a wakeup;
/// the payload is ignored.
pub const ADDING_DDL_JOB_KEY: &str = "/kestrel/ddl/add_ddl_job_general";

/// A watch event. Carries nothing — the write itself is the signal.
#[derive(Debug, Clone, Default)]
pub struct WatchEvent;

/// Etcd-style watch seam. The returned channel closing means the watch
/// broke; the dispatcher rewatches after a back-off.
pub trait JobNotifier: Send + Sync {
    fn watch(&self, key: &str) -> mpsc::Receiver<WatchEvent>;
}

/// Non-blocking ping of a bounded-1 wakeup channel. A full channel means a
/// wakeup is already queued, which is just as good.
pub fn async_notify(tx: &mpsc::Sender<()>) {
    let _ = tx.try_send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_async_notify_never_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        async_notify(&tx);
        async_notify(&tx);
        async_notify(&tx);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
