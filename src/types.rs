//! Shared primitive IDs and wallet enums.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::core::store::StoreError;

/// Account identifier owning a balance.
pub type UserId = u64;
/// External order identifier.
pub type OrderId = u64;
/// Monotonic ledger entry identifier.
pub type EntryId = u64;

/// Closed set of balance-changing event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    /// Tokens bought through a paid top-up order.
    Topup,
    /// Tokens debited to pay for an order.
    Spend,
    /// Manual correction by an administrator.
    AdminAdjust,
}

impl LedgerKind {
    /// Every kind, in storage order.
    pub const ALL: [LedgerKind; 3] = [LedgerKind::Topup, LedgerKind::Spend, LedgerKind::AdminAdjust];

    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerKind::Topup => "topup",
            LedgerKind::Spend => "spend",
            LedgerKind::AdminAdjust => "admin_adjust",
        }
    }

    /// True for kinds that may appear at most once per order.
    pub fn is_order_bound(self) -> bool {
        matches!(self, LedgerKind::Topup | LedgerKind::Spend)
    }
}

impl fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LedgerKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StoreError::InvalidInput(format!("invalid ledger kind: {s:?}")))
    }
}

/// Host order lifecycle status, as far as the wallet cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, not paid.
    #[default]
    Pending,
    /// Paid, awaiting fulfilment.
    Processing,
    /// Paid and fulfilled.
    Completed,
    /// Cancelled by the customer or the shop.
    Cancelled,
    /// Payment failed.
    Failed,
}

impl OrderStatus {
    /// Statuses the host reports once payment has been received.
    pub fn is_paid(self) -> bool {
        matches!(self, OrderStatus::Processing | OrderStatus::Completed)
    }
}
