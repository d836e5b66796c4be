//! Session transaction core: the lazy transaction state machine, its
//! observable runtime info, the deferred timestamp future, and the binlog
//! mutation buffer.

pub mod future;
pub mod info;
pub mod lazy;
pub mod mutation;


pub use future::TxnFuture;
pub use info::{TxnInfo, TxnInfoRecorder, TxnRunningState, MAX_STMT_DIGEST_HISTORY};
pub use lazy::{CommitInterceptor, LazyTxn, NoopInterceptor};
pub use mutation::{PrewriteValue, TableMutation};
