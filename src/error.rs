//! Error taxonomy of the payment workflows.

use thiserror::Error;

use crate::{
    core::store::StoreError,
    orders::OrderBookError,
    runtime::handle::RuntimeError,
    types::OrderId,
};

/// Failures returned by [`crate::workflow::TokenPayments`].
#[derive(Debug, Error)]
pub enum WalletError {
    /// Bad kind, non-positive amount, malformed or missing order.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Not enough tokens; both numbers are shown so the payer can top up.
    #[error("not enough tokens: need {needed}, you have {available}")]
    InsufficientBalance {
        /// Tokens required.
        needed: i64,
        /// Tokens held.
        available: i64,
    },
    /// Another attempt holds the spend lock and has not finished.
    #[error("payment for order #{order_id} is in progress, please try again")]
    PaymentInProgress {
        /// Contended order.
        order_id: OrderId,
    },
    /// The request is well-formed but not allowed.
    #[error("{0}")]
    InvalidOperation(String),
    /// Crediting a paid top-up order failed; recorded on the order for manual follow-up.
    #[error("token credit failed for order #{order_id}: {reason}")]
    CreditFailure {
        /// Top-up order.
        order_id: OrderId,
        /// What went wrong.
        reason: String,
    },
    /// The order collaborator failed.
    #[error(transparent)]
    Orders(#[from] OrderBookError),
    /// The wallet runtime or its journal failed.
    #[error(transparent)]
    Runtime(RuntimeError),
}

impl From<RuntimeError> for WalletError {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::Store(StoreError::InvalidInput(msg)) => WalletError::InvalidInput(msg),
            RuntimeError::Store(StoreError::InsufficientBalance { available, delta, .. }) => {
                WalletError::InsufficientBalance {
                    needed: delta.saturating_neg(),
                    available,
                }
            }
            other => WalletError::Runtime(other),
        }
    }
}
