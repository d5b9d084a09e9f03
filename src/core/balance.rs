use hashbrown::HashMap;
use tracing::warn;

use crate::types::UserId;

/// Cached current balance per user.
///
/// Values are a redundant copy of the ledger sums kept for O(1) reads.
#[derive(Debug, Default, Clone)]
pub struct Balances {
    values: HashMap<UserId, i64>,
}

impl Balances {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current balance, zero for unknown users.
    pub fn get(&self, user_id: UserId) -> i64 {
        self.values.get(&user_id).copied().unwrap_or(0)
    }

    /// Stores `value`, flooring negatives at zero.
    pub fn set(&mut self, user_id: UserId, value: i64) {
        let value = if value < 0 {
            warn!(user_id, value, "refusing negative balance, storing zero");
            0
        } else {
            value
        };
        self.values.insert(user_id, value);
    }

    /// Users with a cached value.
    pub fn iter(&self) -> impl Iterator<Item = (UserId, i64)> + '_ {
        self.values.iter().map(|(user_id, value)| (*user_id, *value))
    }
}
