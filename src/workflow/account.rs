use rust_decimal::Decimal;
use tracing::info;

use crate::{
    entry::{EntryDraft, LedgerEntry},
    error::WalletError,
    types::{LedgerKind, UserId},
};

use super::TokenPayments;

/// Checkout figures for paying an amount with tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendQuote {
    /// Tokens the amount costs.
    pub needed: i64,
    /// Tokens the user holds.
    pub available: i64,
    /// `available >= needed`.
    pub sufficient: bool,
}

impl TokenPayments {
    /// Current balance of `user_id`.
    pub async fn balance(&self, user_id: UserId) -> Result<i64, WalletError> {
        Ok(self.wallet.balance(user_id).await?)
    }

    /// Ledger entries of `user_id`, newest first.
    pub async fn history(&self, user_id: UserId, limit: usize, offset: usize) -> Result<Vec<LedgerEntry>, WalletError> {
        Ok(self.wallet.history(user_id, limit, offset).await?)
    }

    /// What paying `total` in `currency` would cost `user_id`. Read-only.
    pub async fn spend_quote(&self, user_id: UserId, total: Decimal, currency: &str) -> Result<SpendQuote, WalletError> {
        let needed = self.pricing.quote_spend(total, currency)?;
        let available = self.wallet.balance(user_id).await?;
        Ok(SpendQuote {
            needed,
            available,
            sufficient: available >= needed,
        })
    }

    /// Manual correction by an administrator. Negative `delta` cannot overdraw the balance.
    pub async fn adjust(
        &self,
        user_id: UserId,
        delta: i64,
        note: &str,
        admin_id: UserId,
    ) -> Result<LedgerEntry, WalletError> {
        if user_id == 0 || delta == 0 {
            return Err(WalletError::InvalidInput("Invalid user or token amount".to_string()));
        }
        let draft = EntryDraft::new(user_id, LedgerKind::AdminAdjust, delta)
            .with_note(note)
            .with_meta("admin_id", admin_id);
        let entry = self.wallet.change(draft).await?;
        info!(user_id, tokens = delta, admin_id, entry_id = entry.id, "balance adjusted by admin");
        Ok(entry)
    }
}
