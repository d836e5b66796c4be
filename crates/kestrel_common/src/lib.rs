pub mod config;
pub mod error;
pub mod types;

pub use error::{DdlError, ErrorKind, KestrelError, KestrelResult, TxnError};
pub use types::{JobId, SchemaId, TableId, Timestamp};
