//! Host order contract consumed by the payment workflows.

use std::sync::Mutex;

use hashbrown::HashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{OrderId, OrderStatus, UserId};

/// Failures of the order collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderBookError {
    /// No order with this id.
    #[error("order #{0} not found")]
    NotFound(OrderId),
    /// The backing store failed.
    #[error("order storage: {0}")]
    Storage(String),
}

/// Wallet flags kept in the order's metadata.
///
/// `tokens_credited` and `tokens_spent` only ever go from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderMeta {
    /// The order buys tokens.
    pub is_topup: bool,
    /// Tokens bought, fixed when the top-up order is created.
    pub tokens_qty: i64,
    /// Top-up tokens have been credited.
    pub tokens_credited: bool,
    /// The order has been paid with tokens.
    pub tokens_spent: bool,
    /// Tokens debited for the order.
    pub tokens_spent_qty: Option<i64>,
}

/// Order as seen by the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Host order id.
    pub id: OrderId,
    /// Paying account; `None` for guest checkouts.
    pub customer_id: Option<UserId>,
    /// Grand total in `currency`.
    pub total: Decimal,
    /// ISO currency code of `total`.
    pub currency: String,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Physical goods that still need shipping.
    pub needs_processing: bool,
    /// Host product that marks a top-up order.
    pub product_id: Option<u64>,
    /// Wallet flags.
    pub meta: OrderMeta,
    /// Audit notes, oldest first.
    pub notes: Vec<String>,
}

impl Order {
    /// Appends an audit note.
    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// The paying account, if it is a real one.
    pub fn payer(&self) -> Option<UserId> {
        self.customer_id.filter(|id| *id > 0)
    }

    /// Marks payment received, choosing the status the host would.
    pub fn complete_payment(&mut self) {
        self.status = if self.needs_processing {
            OrderStatus::Processing
        } else {
            OrderStatus::Completed
        };
    }
}

/// Order creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    /// Paying account.
    pub customer_id: Option<UserId>,
    /// Grand total in `currency`.
    pub total: Decimal,
    /// ISO currency code of `total`.
    pub currency: String,
    /// Physical goods that still need shipping.
    pub needs_processing: bool,
    /// Purchased product, when it matters to the wallet.
    pub product_id: Option<u64>,
    /// Initial wallet flags.
    pub meta: OrderMeta,
}

/// Order persistence owned by the host platform.
pub trait OrderBook: Send + Sync {
    /// Loads an order.
    fn load(&self, id: OrderId) -> Result<Order, OrderBookError>;
    /// Persists every field of `order`.
    fn save(&self, order: &Order) -> Result<(), OrderBookError>;
    /// Creates an order and assigns its id.
    fn create(&self, order: NewOrder) -> Result<Order, OrderBookError>;
}

#[derive(Debug, Default)]
struct BookState {
    orders: HashMap<OrderId, Order>,
    next_id: OrderId,
}

/// In-process [`OrderBook`], for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryOrderBook {
    state: Mutex<BookState>,
}

impl MemoryOrderBook {
    /// Empty book; the first order gets id 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a fully formed order, replacing any with the same id.
    pub fn insert(&self, order: Order) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_id = state.next_id.max(order.id);
        state.orders.insert(order.id, order);
    }
}

impl OrderBook for MemoryOrderBook {
    fn load(&self, id: OrderId) -> Result<Order, OrderBookError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.orders.get(&id).cloned().ok_or(OrderBookError::NotFound(id))
    }

    fn save(&self, order: &Order) -> Result<(), OrderBookError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.orders.contains_key(&order.id) {
            return Err(OrderBookError::NotFound(order.id));
        }
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    fn create(&self, order: NewOrder) -> Result<Order, OrderBookError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_id += 1;
        let order = Order {
            id: state.next_id,
            customer_id: order.customer_id,
            total: order.total,
            currency: order.currency,
            status: OrderStatus::Pending,
            needs_processing: order.needs_processing,
            product_id: order.product_id,
            meta: order.meta,
            notes: Vec::new(),
        };
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }
}
