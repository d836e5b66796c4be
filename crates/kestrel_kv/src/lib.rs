//! KV-side building blocks for the session transaction core: the staged
//! write buffer, the key codec, and the narrow traits behind which the real
//! KV client, storage engine and timestamp oracle live.

pub mod buffer;
pub mod keycodec;
pub mod txn;

pub use buffer::{BufferCheckpoint, KeyFlags, MemBuffer, StagingHandle};
pub use txn::{
    BeginOptions, Key, KvTransaction, LockCtx, StoreKind, Storage, TableInfo, TableInfoCache,
    TsFuture,
};
