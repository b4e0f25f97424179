use crate::engine::TxOutcome;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no database connection is established")]
    NotConnected,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("transaction completed ({outcome}) while its callback is still pending")]
    TransactionPrematurelyCompleted { outcome: TxOutcome },
    #[error("transaction is no longer active")]
    TransactionInactive,
    #[error("write attempted in a read-only transaction")]
    ReadOnly,
    #[error("store `{0}` is not part of this transaction")]
    StoreNotInTransaction(String),
    #[error("no such store: {0}")]
    NoSuchStore(String),
    #[error("no such index: {0}")]
    NoSuchIndex(String),
    #[error("no such table: {0}")]
    NoSuchTable(String),
    #[error("invalid query: {0}")]
    InvalidQuery(&'static str),
    #[error("requested version {requested} is below the stored version {stored}")]
    VersionBelowStored { requested: u32, stored: u32 },
    #[error("database `{0}` is still open")]
    DatabaseOpen(String),
    #[error("value is not usable as a key: {0}")]
    InvalidKey(String),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
