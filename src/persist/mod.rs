/// SQLite journal sink.
pub mod sqlite;

use thiserror::Error;

use crate::{
    core::store::StoreError,
    entry::LedgerEntry,
    types::EntryId,
};

/// Failures of the persistence layer.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite reported an error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Meta payload could not be encoded or decoded.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// The stored balance would have gone negative; the batch was rolled back.
    #[error("journal rejected entry #{entry_id}: stored balance of user #{user_id} cannot absorb {tokens}")]
    Rejected {
        /// Entry that failed the conditional update.
        entry_id: EntryId,
        /// Account concerned.
        user_id: u64,
        /// Delta that did not fit.
        tokens: i64,
    },
    /// Replaying a row failed.
    #[error("replay: {0}")]
    Replay(#[from] StoreError),
    /// Anything else.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Durable destination for committed ledger entries.
pub trait JournalSink: Send {
    /// Writes `entries` atomically and returns the highest id now durable.
    fn append_entries(&mut self, entries: &[LedgerEntry]) -> PersistResult<EntryId>;
    /// Forces buffered writes to stable storage.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
}
