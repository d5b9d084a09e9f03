use hashbrown::HashMap;

use crate::types::{EntryId, LedgerKind, OrderId};

/// Entry ids grouped by key, oldest first.
pub type VecIndex<K> = HashMap<K, Vec<EntryId>>;

/// Unique entry per order-bound kind.
pub type OrderIndex = HashMap<(LedgerKind, OrderId), EntryId>;
