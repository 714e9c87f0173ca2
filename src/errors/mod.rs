use crate::txn::TxnId;

/// Error kinds surfaced by the storage kernel. They travel inside
/// [`anyhow::Error`]; callers that need to branch on the kind use
/// `err.downcast_ref::<DbError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum DbError {
    /// A table, tuple or page the caller named does not exist.
    NotFound(String),
    /// A lock request that cannot be satisfied aborted the transaction.
    Conflict(String),
    /// The transaction was chosen as a deadlock victim.
    Deadlock(TxnId),
    /// NOT NULL, arity or type violation of a schema.
    Constraint(String),
    Io(String),
    /// A log record or page image failed to deserialize.
    Corruption(String),
    /// Every frame is pinned, the catalog page is full, or the disk is.
    Exhausted(String),
    /// Caller misuse, e.g. unpinning a page that is not pinned.
    Invariant(String),
    /// Two values of these kinds cannot be compared.
    Incompatible(String, String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::NotFound(what) => write!(f, "{what} not found."),
            DbError::Conflict(context) => write!(f, "Transaction aborted: {context}."),
            DbError::Deadlock(txn_id) => {
                write!(f, "Transaction {txn_id} chosen as deadlock victim.")
            }
            DbError::Constraint(context) => write!(f, "Constraint violation: {context}."),
            DbError::Io(context) => write!(f, "I/O error: {context}."),
            DbError::Corruption(context) => write!(f, "Corrupted data: {context}."),
            DbError::Exhausted(resource) => write!(f, "Out of {resource}."),
            DbError::Invariant(context) => write!(f, "Internal invariant broken: {context}."),
            DbError::Incompatible(left, right) => {
                write!(f, "Cannot compare {left} with {right}.")
            }
        }
    }
}

impl std::error::Error for DbError {}
