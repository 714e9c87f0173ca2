mod buffer_pool;
mod catalog;
mod disk_manager;
mod engine;
mod errors;
mod index;
mod latch;
mod lock_manager;
mod pages;
mod table;
mod tuple;
mod txn;
mod types;
mod wal;

pub use buffer_pool::{ReplacerKind, DEFAULT_POOL_SIZE};
pub use catalog::{IndexOid, TableOid};
pub use engine::Engine;
pub use errors::DbError;
pub use index::Index;
pub use lock_manager::LockMode;
pub use pages::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
pub use tuple::schema::{Field, Schema};
pub use tuple::{Rid, SlotId, Tuple};
pub use txn::{IsolationLevel, Transaction, TransactionState, TxnId, INVALID_TXN_ID};
pub use types::{Types, Value};
pub use wal::{Lsn, INVALID_LSN};
