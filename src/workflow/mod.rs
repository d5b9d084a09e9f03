//! Token payment workflows over the wallet runtime and the host collaborators.

/// Balance reads, quotes, and administrator adjustments.
pub mod account;
/// Crediting paid top-up orders.
pub mod credit;
/// Paying orders with tokens.
pub mod spend;
/// Creating top-up orders.
pub mod topup;

use std::{sync::Arc, time::Duration};

use crate::{
    config::WalletConfig,
    error::WalletError,
    lock::LockService,
    orders::{Order, OrderBook, OrderBookError},
    rate::{ConversionSource, Pricing},
    runtime::handle::WalletHandle,
    types::OrderId,
};

pub use account::SpendQuote;
pub use credit::{CreditOutcome, SkipReason};
pub use spend::PaymentReceipt;
pub use topup::TopupRequest;

/// Knobs of the payment workflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentSettings {
    /// Lifetime of the per-order spend lock.
    pub spend_lock_ttl: Duration,
    /// Product attached to generated top-up orders.
    pub topup_product_id: Option<u64>,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            spend_lock_ttl: Duration::from_secs(45),
            topup_product_id: None,
        }
    }
}

/// Explicitly wired payment service: wallet runtime, orders, locks, and pricing.
#[derive(Clone)]
pub struct TokenPayments {
    wallet: WalletHandle,
    orders: Arc<dyn OrderBook>,
    locks: Arc<dyn LockService>,
    pricing: Pricing,
    settings: PaymentSettings,
}

impl TokenPayments {
    /// Wires the service from its collaborators.
    pub fn new(
        wallet: WalletHandle,
        orders: Arc<dyn OrderBook>,
        locks: Arc<dyn LockService>,
        pricing: Pricing,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            wallet,
            orders,
            locks,
            pricing,
            settings,
        }
    }

    /// Wires the service using rate, currency, and lock settings from `config`.
    pub fn from_config(
        config: &WalletConfig,
        wallet: WalletHandle,
        orders: Arc<dyn OrderBook>,
        locks: Arc<dyn LockService>,
        conversion: Arc<dyn ConversionSource>,
    ) -> Self {
        let pricing = Pricing::new(config.rate(), config.reference_currency.clone()).with_conversion(conversion);
        let settings = PaymentSettings {
            spend_lock_ttl: config.spend_lock_ttl(),
            topup_product_id: config.topup_product_id,
        };
        Self::new(wallet, orders, locks, pricing, settings)
    }

    /// Pricing in effect.
    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Underlying wallet runtime.
    pub fn wallet(&self) -> &WalletHandle {
        &self.wallet
    }

    fn load_order(&self, order_id: OrderId) -> Result<Order, WalletError> {
        match self.orders.load(order_id) {
            Ok(order) => Ok(order),
            Err(OrderBookError::NotFound(id)) => Err(WalletError::InvalidInput(format!("order #{id} not found"))),
            Err(err) => Err(err.into()),
        }
    }
}
