use tracing::{error, info, warn};

use crate::{
    core::store::StoreError,
    entry::EntryDraft,
    error::WalletError,
    lock::LockGuard,
    orders::Order,
    runtime::handle::RuntimeError,
    types::{EntryId, LedgerKind, OrderId},
};

use super::TokenPayments;

/// Prefix of the per-order spend lock key.
pub const SPEND_LOCK_PREFIX: &str = "spend:";

/// Result of a successful [`TokenPayments::pay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    /// Paid order.
    pub order_id: OrderId,
    /// Tokens debited for the order.
    pub tokens_spent: i64,
    /// Debit entry written by this call, `None` on replays.
    pub entry_id: Option<EntryId>,
    /// The order had already been paid before this call.
    pub already_paid: bool,
}

impl PaymentReceipt {
    fn replayed(order: &Order) -> Self {
        Self {
            order_id: order.id,
            tokens_spent: order.meta.tokens_spent_qty.unwrap_or(0),
            entry_id: None,
            already_paid: true,
        }
    }
}

impl TokenPayments {
    /// Pays `order_id` with the payer's tokens, debiting at most once per order.
    ///
    /// The spend flag is checked before taking the lock, again when the lock is busy, and once
    /// more under the lock. The ledger additionally refuses a second spend entry for the order.
    pub async fn pay(&self, order_id: OrderId) -> Result<PaymentReceipt, WalletError> {
        let order = self.load_order(order_id)?;
        if order.meta.tokens_spent {
            return Ok(PaymentReceipt::replayed(&order));
        }

        let payer = order
            .payer()
            .ok_or_else(|| WalletError::InvalidInput("you must be logged in to pay with tokens".to_string()))?;
        if order.meta.is_topup {
            return Err(WalletError::InvalidOperation(
                "top-up orders cannot be paid with tokens".to_string(),
            ));
        }

        let total_reference = self.pricing.convert_to_reference(order.total, &order.currency)?;
        let needed = self.pricing.tokens_needed(total_reference)?;
        if needed <= 0 {
            return Err(WalletError::InvalidInput(format!(
                "invalid token calculation for order #{order_id}: {needed}"
            )));
        }

        let available = self.wallet.balance(payer).await?;
        if available < needed {
            return Err(WalletError::InsufficientBalance { needed, available });
        }

        let key = format!("{SPEND_LOCK_PREFIX}{order_id}");
        let Some(_guard) = LockGuard::acquire(self.locks.as_ref(), key, self.settings.spend_lock_ttl) else {
            let order = self.load_order(order_id)?;
            if order.meta.tokens_spent {
                return Ok(PaymentReceipt::replayed(&order));
            }
            warn!(order_id, "spend lock busy");
            return Err(WalletError::PaymentInProgress { order_id });
        };

        let mut order = self.load_order(order_id)?;
        if order.meta.tokens_spent {
            return Ok(PaymentReceipt::replayed(&order));
        }

        let draft = EntryDraft::new(payer, LedgerKind::Spend, -needed)
            .with_order(order_id)
            .with_note("Paid with tokens")
            .with_meta("order_total", order.total.to_string())
            .with_meta("order_total_reference", total_reference.to_string())
            .with_meta("rate", self.pricing.rate().to_string())
            .with_meta("needed_tokens", needed)
            .with_meta("currency", order.currency.clone())
            .with_meta("reference_currency", self.pricing.reference_currency());

        let (spent, entry_id) = match self.wallet.change(draft).await {
            Ok(entry) => (needed, Some(entry.id)),
            Err(RuntimeError::Store(StoreError::DuplicateOrderEntry { entry_id, .. })) => {
                warn!(order_id, entry_id, "order already debited, restoring spend flag");
                let spent = self
                    .wallet
                    .entry_for_order(LedgerKind::Spend, order_id)
                    .await?
                    .map(|entry| entry.tokens.saturating_neg())
                    .unwrap_or(needed);
                (spent, None)
            }
            Err(err) => return Err(err.into()),
        };

        order.meta.tokens_spent = true;
        order.meta.tokens_spent_qty = Some(spent);
        order.complete_payment();
        order.add_note("Paid with tokens.");
        order.add_note(format!("Spent {spent} tokens from user #{payer}"));
        if let Err(err) = self.orders.save(&order) {
            error!(order_id, user_id = payer, tokens = spent, error = %err, "tokens debited but order not updated");
            return Err(err.into());
        }

        info!(order_id, user_id = payer, tokens = spent, "order paid with tokens");
        Ok(PaymentReceipt {
            order_id,
            tokens_spent: spent,
            entry_id,
            already_paid: entry_id.is_none(),
        })
    }
}
