//! Ledger entry record and draft types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EntryId, LedgerKind, OrderId, UserId};

/// Meta key holding the balance before the change.
pub const META_OLD_BALANCE: &str = "old_balance";
/// Meta key holding the balance after the change.
pub const META_NEW_BALANCE: &str = "new_balance";

/// Opaque audit payload attached to an entry.
pub type EntryMeta = serde_json::Map<String, Value>;

/// Immutable, fully materialized ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Identifier assigned at insertion.
    pub id: EntryId,
    /// Owning account.
    pub user_id: UserId,
    /// Event kind.
    pub kind: LedgerKind,
    /// Signed token delta.
    pub tokens: i64,
    /// Related order, if any.
    pub order_id: Option<OrderId>,
    /// Free-text annotation.
    pub note: String,
    /// Insertion timestamp in milliseconds since epoch.
    pub created_at_ms: u64,
    /// Write-once audit payload.
    pub meta: EntryMeta,
}

/// Balance change request used to create a new [`LedgerEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    /// Owning account.
    pub user_id: UserId,
    /// Event kind.
    pub kind: LedgerKind,
    /// Signed token delta.
    pub tokens: i64,
    /// Related order, if any.
    pub order_id: Option<OrderId>,
    /// Free-text annotation.
    pub note: String,
    /// Caller-supplied audit payload.
    pub meta: EntryMeta,
}

impl EntryDraft {
    /// Starts a draft with no order, note, or meta.
    pub fn new(user_id: UserId, kind: LedgerKind, tokens: i64) -> Self {
        Self {
            user_id,
            kind,
            tokens,
            order_id: None,
            note: String::new(),
            meta: EntryMeta::new(),
        }
    }

    /// Binds the draft to an order.
    pub fn with_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    /// Sets the annotation.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Adds one audit field.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}
