use hashbrown::HashMap;

use crate::{
    entry::{EntryDraft, LedgerEntry},
    types::{EntryId, LedgerKind, OrderId, UserId},
};

use super::{
    indices::{OrderIndex, VecIndex},
    store::StoreError,
};

/// Append-only history of balance-changing events.
///
/// Entries are never updated or removed once appended.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    pos: HashMap<EntryId, usize>,
    by_user: VecIndex<UserId>,
    by_order: OrderIndex,
    next_entry_id: EntryId,
}

impl Ledger {
    /// Empty ledger whose first entry gets id 1.
    pub fn new() -> Self {
        Self {
            next_entry_id: 1,
            ..Self::default()
        }
    }

    /// Appends a new entry and returns it with its assigned id.
    pub fn append(&mut self, draft: EntryDraft, created_at_ms: u64) -> Result<LedgerEntry, StoreError> {
        let entry = self.prepare(draft, created_at_ms)?;
        self.insert(entry.clone())?;
        Ok(entry)
    }

    /// Materializes the entry `append` would add, without adding it.
    pub fn prepare(&self, draft: EntryDraft, created_at_ms: u64) -> Result<LedgerEntry, StoreError> {
        self.check_order_slot(draft.kind, draft.order_id)?;
        Ok(LedgerEntry {
            id: self.next_entry_id,
            user_id: draft.user_id,
            kind: draft.kind,
            tokens: draft.tokens,
            order_id: draft.order_id,
            note: draft.note,
            created_at_ms,
            meta: draft.meta,
        })
    }

    /// Inserts a fully formed entry, keeping its id. Used for prepared entries and journal replay.
    pub fn commit(&mut self, entry: LedgerEntry) -> Result<(), StoreError> {
        self.check_order_slot(entry.kind, entry.order_id)?;
        self.insert(entry)
    }

    /// Entry by id.
    pub fn get(&self, id: EntryId) -> Option<&LedgerEntry> {
        self.pos.get(&id).map(|idx| &self.entries[*idx])
    }

    /// Entries for `user_id`, newest first, skipping `offset` and returning at most `limit`.
    pub fn list_for_user(&self, user_id: UserId, limit: usize, offset: usize) -> Vec<&LedgerEntry> {
        self.by_user
            .get(&user_id)
            .into_iter()
            .flat_map(|ids| ids.iter().rev())
            .skip(offset)
            .take(limit)
            .filter_map(|id| self.get(*id))
            .collect()
    }

    /// Owned variant of [`Ledger::list_for_user`].
    pub fn list_for_user_cloned(&self, user_id: UserId, limit: usize, offset: usize) -> Vec<LedgerEntry> {
        self.list_for_user(user_id, limit, offset)
            .into_iter()
            .cloned()
            .collect()
    }

    /// The single entry of an order-bound kind recorded for `order_id`.
    pub fn entry_for_order(&self, kind: LedgerKind, order_id: OrderId) -> Option<&LedgerEntry> {
        self.by_order
            .get(&(kind, order_id))
            .and_then(|id| self.get(*id))
    }

    /// Sum of every delta recorded for `user_id`.
    pub fn sum_for_user(&self, user_id: UserId) -> i64 {
        self.by_user
            .get(&user_id)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.get(*id))
            .map(|e| e.tokens)
            .sum()
    }

    /// Users with at least one entry.
    pub fn users(&self) -> impl Iterator<Item = UserId> + '_ {
        self.by_user.keys().copied()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been appended.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest assigned id, 0 when empty.
    pub fn latest_entry_id(&self) -> EntryId {
        self.next_entry_id.saturating_sub(1)
    }

    fn check_order_slot(&self, kind: LedgerKind, order_id: Option<OrderId>) -> Result<(), StoreError> {
        let Some(order_id) = order_id else {
            return Ok(());
        };
        if !kind.is_order_bound() {
            return Ok(());
        }
        match self.by_order.get(&(kind, order_id)) {
            Some(entry_id) => Err(StoreError::DuplicateOrderEntry {
                kind,
                order_id,
                entry_id: *entry_id,
            }),
            None => Ok(()),
        }
    }

    fn insert(&mut self, entry: LedgerEntry) -> Result<(), StoreError> {
        if self.pos.contains_key(&entry.id) {
            return Err(StoreError::DuplicateEntry(entry.id));
        }
        if !self.entries.is_empty() && entry.id <= self.latest_entry_id() {
            return Err(StoreError::InvalidInput(format!(
                "entry #{} is out of order (latest #{})",
                entry.id,
                self.latest_entry_id()
            )));
        }

        let id = entry.id;
        self.next_entry_id = self.next_entry_id.max(id.saturating_add(1));
        self.by_user.entry(entry.user_id).or_default().push(id);
        if let Some(order_id) = entry.order_id {
            if entry.kind.is_order_bound() {
                self.by_order.insert((entry.kind, order_id), id);
            }
        }
        self.pos.insert(id, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }
}
