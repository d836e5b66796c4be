//! Internal SQL session seam.
//!
//! The job store and the migration bridge run plain SQL against the
//! cluster's own system session. Sessions come from a pool; the dispatcher
//! keeps one checked out for its whole life, everything else borrows one
//! per operation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use kestrel_common::error::KestrelResult;

/// Disk-full admission policy for internal statements. Job bookkeeping must
/// still go through when user writes are already being rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskFullOpt {
    #[default]
    NotAllowed,
    AllowedOnAlmostFull,
}

/// One column value of an internal result row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
}

/// One internal result row.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow(pub Vec<SqlValue>);

impl SqlRow {
    pub fn int(&self, idx: usize) -> Option<i64> {
        match self.0.get(idx)? {
            SqlValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn bytes(&self, idx: usize) -> Option<&[u8]> {
        match self.0.get(idx)? {
            SqlValue::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }
}

/// An internal SQL session. `label` tags the statement for diagnostics.
#[async_trait]
pub trait SqlSession: Send + Sync {
    async fn execute(
        &self,
        ctx: &CancellationToken,
        sql: &str,
        label: &'static str,
    ) -> KestrelResult<Vec<SqlRow>>;

    async fn begin(&self, ctx: &CancellationToken) -> KestrelResult<()>;

    async fn commit(&self, ctx: &CancellationToken) -> KestrelResult<()>;

    async fn rollback(&self) -> KestrelResult<()>;

    fn set_disk_full_opt(&self, opt: DiskFullOpt);
}

/// Pool of internal sessions.
#[async_trait]
pub trait SessionPool: Send + Sync {
    async fn get(&self) -> KestrelResult<Arc<dyn SqlSession>>;

    fn put(&self, sess: Arc<dyn SqlSession>);
}
