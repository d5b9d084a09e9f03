//! Runtime event stream payloads.

use crate::types::{EntryId, LedgerKind, OrderId, UserId};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    /// A balance change was committed in memory.
    EntryAppended {
        /// New entry id.
        entry_id: EntryId,
        /// Account changed.
        user_id: UserId,
        /// Entry kind.
        kind: LedgerKind,
        /// Signed delta.
        tokens: i64,
        /// Related order, if any.
        order_id: Option<OrderId>,
        /// Balance after the change.
        balance: i64,
    },
    /// Persistence has reached at least this entry id.
    DurableUpTo {
        /// Highest entry id known durable.
        entry_id: EntryId,
    },
}
