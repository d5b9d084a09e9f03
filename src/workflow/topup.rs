use rust_decimal::Decimal;
use tracing::info;

use crate::{
    error::WalletError,
    orders::{NewOrder, Order, OrderMeta},
    types::UserId,
};

use super::TokenPayments;

/// What the customer asked to buy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopupRequest {
    /// A fixed number of tokens, priced in the reference currency.
    Tokens(i64),
    /// Whatever `amount` of `currency` buys, rounded down to whole tokens.
    Amount {
        /// Money offered.
        amount: Decimal,
        /// Currency of `amount`.
        currency: String,
    },
}

impl TokenPayments {
    /// Creates a pending top-up order for `user_id`.
    ///
    /// Tokens are credited later, when the order reaches a paid status.
    pub fn create_topup_order(&self, user_id: UserId, request: TopupRequest) -> Result<Order, WalletError> {
        if user_id == 0 {
            return Err(WalletError::InvalidInput("a top-up needs a customer account".to_string()));
        }

        let (tokens, total, currency) = match request {
            TopupRequest::Tokens(qty) => {
                if qty <= 0 {
                    return Err(WalletError::InvalidInput("Invalid token quantity".to_string()));
                }
                let total = self.pricing.rate().cost_of(qty)?;
                (qty, total, self.pricing.reference_currency().to_string())
            }
            TopupRequest::Amount { amount, currency } => {
                if amount <= Decimal::ZERO {
                    return Err(WalletError::InvalidInput("Invalid amount".to_string()));
                }
                let qty = self.pricing.quote_topup(amount, &currency)?;
                if qty < 1 {
                    return Err(WalletError::InvalidInput(
                        "Amount is too low to receive at least 1 token".to_string(),
                    ));
                }
                (qty, amount, currency)
            }
        };

        let order = self.orders.create(NewOrder {
            customer_id: Some(user_id),
            total,
            currency,
            needs_processing: false,
            product_id: self.settings.topup_product_id,
            meta: OrderMeta {
                is_topup: true,
                tokens_qty: tokens,
                ..OrderMeta::default()
            },
        })?;
        info!(order_id = order.id, user_id, tokens, "top-up order created");
        Ok(order)
    }
}
