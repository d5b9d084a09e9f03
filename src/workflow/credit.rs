use tracing::{debug, error, info, warn};

use crate::{
    core::store::StoreError,
    entry::EntryDraft,
    error::WalletError,
    runtime::handle::RuntimeError,
    types::{EntryId, LedgerKind, OrderId, OrderStatus},
};

use super::TokenPayments;

/// Why a credit attempt did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The order does not buy tokens.
    NotTopup,
    /// Guest order with no account to credit.
    NoPayer,
    /// No positive token quantity recorded on the order.
    NoQuantity,
}

/// Result of a successful [`TokenPayments::credit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    /// Tokens were added by this call.
    Credited {
        /// Top-up ledger entry.
        entry_id: EntryId,
        /// Tokens added.
        tokens: i64,
    },
    /// An earlier call already credited the order.
    AlreadyCredited,
    /// Nothing to credit.
    Skipped(SkipReason),
}

impl TokenPayments {
    /// Credits the tokens bought by a paid top-up order, at most once per order.
    pub async fn credit(&self, order_id: OrderId) -> Result<CreditOutcome, WalletError> {
        let mut order = self.load_order(order_id)?;
        if !order.meta.is_topup {
            return Ok(CreditOutcome::Skipped(SkipReason::NotTopup));
        }
        if order.meta.tokens_credited {
            return Ok(CreditOutcome::AlreadyCredited);
        }
        let Some(payer) = order.payer() else {
            debug!(order_id, "top-up order has no customer, nothing to credit");
            return Ok(CreditOutcome::Skipped(SkipReason::NoPayer));
        };
        let tokens = order.meta.tokens_qty;
        if tokens <= 0 {
            return Ok(CreditOutcome::Skipped(SkipReason::NoQuantity));
        }

        let draft = EntryDraft::new(payer, LedgerKind::Topup, tokens)
            .with_order(order_id)
            .with_note("Token top-up via order")
            .with_meta("order_total", order.total.to_string())
            .with_meta("currency", order.currency.clone());

        match self.wallet.change(draft).await {
            Ok(entry) => {
                order.meta.tokens_credited = true;
                order.add_note(format!("Credited {tokens} tokens to user #{payer}"));
                self.orders.save(&order)?;
                info!(order_id, user_id = payer, tokens, "top-up credited");
                Ok(CreditOutcome::Credited {
                    entry_id: entry.id,
                    tokens,
                })
            }
            Err(RuntimeError::Store(StoreError::DuplicateOrderEntry { entry_id, .. })) => {
                warn!(order_id, entry_id, "top-up already in ledger, restoring credit flag");
                order.meta.tokens_credited = true;
                self.orders.save(&order)?;
                Ok(CreditOutcome::AlreadyCredited)
            }
            Err(err) => {
                let reason = err.to_string();
                error!(order_id, user_id = payer, tokens, %reason, "top-up credit failed");
                order.add_note(format!("Token credit failed: {reason}"));
                self.orders.save(&order)?;
                Err(WalletError::CreditFailure { order_id, reason })
            }
        }
    }

    /// Status-transition hook: credits the order once it reaches a paid status.
    ///
    /// Returns `None` for transitions that do not concern the wallet.
    pub async fn on_status_changed(
        &self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<Option<CreditOutcome>, WalletError> {
        if !status.is_paid() {
            return Ok(None);
        }
        self.credit(order_id).await.map(Some)
    }
}
