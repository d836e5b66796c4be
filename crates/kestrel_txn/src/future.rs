//! Deferred transaction acquisition.
//!
//! A `TxnFuture` is a one-shot promise: wait for the start timestamp from
//! the oracle, then open the KV transaction with it. On timestamp failure
//! the policy depends on the store: an in-memory store surfaces the error,
//! a distributed store retries `begin` without a pre-fetched timestamp
//! (the store will fetch its own).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use kestrel_common::error::KestrelResult;
use kestrel_kv::{BeginOptions, KvTransaction, StoreKind, Storage, TsFuture};

/// Promise producing a started KV transaction.
pub struct TxnFuture {
    future: Box<dyn TsFuture>,
    store: Arc<dyn Storage>,
    txn_scope: String,
}

impl TxnFuture {
    pub fn new(future: Box<dyn TsFuture>, store: Arc<dyn Storage>, txn_scope: String) -> TxnFuture {
        TxnFuture {
            future,
            store,
            txn_scope,
        }
    }

    pub(crate) async fn wait(
        self,
        ctx: &CancellationToken,
    ) -> KestrelResult<Box<dyn KvTransaction>> {
        match self.future.wait(ctx).await {
            Ok(start_ts) => {
                self.store
                    .begin(BeginOptions {
                        txn_scope: self.txn_scope,
                        start_ts: Some(start_ts),
                    })
                    .await
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) if self.store.kind() == StoreKind::InMemory => Err(err),
            Err(err) => {
                tracing::warn!(error = %err, "wait tso failed");
                // Retry without a pre-fetched timestamp.
                self.store
                    .begin(BeginOptions {
                        txn_scope: self.txn_scope,
                        start_ts: None,
                    })
                    .await
            }
        }
    }
}

impl std::fmt::Debug for TxnFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnFuture")
            .field("txn_scope", &self.txn_scope)
            .finish_non_exhaustive()
    }
}
