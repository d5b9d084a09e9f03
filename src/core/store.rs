use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::{
    clock::{Clock, SystemClock},
    entry::{EntryDraft, LedgerEntry, META_NEW_BALANCE, META_OLD_BALANCE},
    types::{EntryId, LedgerKind, OrderId, UserId},
};

use super::{balance::Balances, ledger::Ledger};

/// Failures of the in-memory wallet store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Malformed request or row.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The change would drive the balance below zero.
    #[error("insufficient balance for user #{user_id}: have {available}, change {delta}")]
    InsufficientBalance {
        /// Account being changed.
        user_id: UserId,
        /// Balance before the change.
        available: i64,
        /// Rejected delta.
        delta: i64,
    },
    /// An entry with this id is already present.
    #[error("entry #{0} already exists")]
    DuplicateEntry(EntryId),
    /// The order already carries an entry of this kind.
    #[error("order #{order_id} already has a {kind} entry (#{entry_id})")]
    DuplicateOrderEntry {
        /// Order-bound kind.
        kind: LedgerKind,
        /// Order reference.
        order_id: OrderId,
        /// Entry recorded earlier.
        entry_id: EntryId,
    },
}

/// Authoritative wallet state: the ledger plus the cached balances derived from it.
///
/// [`WalletStore::change`] is the only way to mutate either half, so
/// `balance(u) == sum(tokens for u)` holds after every call.
#[derive(Debug)]
pub struct WalletStore {
    ledger: Ledger,
    balances: Balances,
    pending: Vec<LedgerEntry>,
    clock: Arc<dyn Clock>,
}

impl Default for WalletStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletStore {
    /// Empty store stamped by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamped by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: Ledger::new(),
            balances: Balances::new(),
            pending: Vec::new(),
            clock,
        }
    }

    /// Applies a signed delta, recording it in the ledger.
    ///
    /// Nothing is written when the result would be negative.
    pub fn change(&mut self, draft: EntryDraft) -> Result<LedgerEntry, StoreError> {
        let entry = self.prepare(draft)?;
        self.commit(entry.clone())?;
        self.pending.push(entry.clone());
        Ok(entry)
    }

    /// Validates `draft` and builds the entry [`WalletStore::change`] would append, leaving the
    /// store untouched.
    ///
    /// The entry stays valid until the next mutation; hand it to [`WalletStore::commit`] once it
    /// has been journaled.
    pub fn prepare(&self, mut draft: EntryDraft) -> Result<LedgerEntry, StoreError> {
        let current = self.balances.get(draft.user_id);
        let next = next_balance(draft.user_id, current, draft.tokens)?;
        draft.meta.insert(META_OLD_BALANCE.to_string(), current.into());
        draft.meta.insert(META_NEW_BALANCE.to_string(), next.into());
        self.ledger.prepare(draft, self.clock.now_ms())
    }

    /// Applies an entry built by [`WalletStore::prepare`]. Not queued for the journal.
    pub fn commit(&mut self, entry: LedgerEntry) -> Result<(), StoreError> {
        let user_id = entry.user_id;
        let next = next_balance(user_id, self.balances.get(user_id), entry.tokens)?;
        let (entry_id, tokens) = (entry.id, entry.tokens);
        self.ledger.commit(entry)?;
        self.balances.set(user_id, next);
        debug!(entry_id, user_id, tokens, balance = next, "ledger entry committed");
        Ok(())
    }

    /// Rebuilds state from a journal row. Balances follow the ledger sum.
    pub fn apply_replayed_entry(&mut self, entry: LedgerEntry) -> Result<(), StoreError> {
        let user_id = entry.user_id;
        let next = self
            .balances
            .get(user_id)
            .checked_add(entry.tokens)
            .ok_or_else(|| StoreError::InvalidInput(format!("balance overflow replaying entry #{}", entry.id)))?;
        self.ledger.commit(entry)?;
        self.balances.set(user_id, next);
        Ok(())
    }

    /// Current balance.
    pub fn balance(&self, user_id: UserId) -> i64 {
        self.balances.get(user_id)
    }

    /// Read access to the cached balances.
    pub fn balances(&self) -> &Balances {
        &self.balances
    }

    /// Read access to the ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Entries appended since the last drain, oldest first.
    pub fn drain_pending_entries(&mut self) -> Vec<LedgerEntry> {
        std::mem::take(&mut self.pending)
    }

    /// Highest entry id known to the store.
    pub fn latest_entry_id(&self) -> EntryId {
        self.ledger.latest_entry_id()
    }
}

fn next_balance(user_id: UserId, current: i64, delta: i64) -> Result<i64, StoreError> {
    let next = current.checked_add(delta).ok_or_else(|| {
        StoreError::InvalidInput(format!("balance overflow for user #{user_id}: {current} + {delta}"))
    })?;
    if next < 0 {
        return Err(StoreError::InsufficientBalance {
            user_id,
            available: current,
            delta,
        });
    }
    Ok(next)
}
