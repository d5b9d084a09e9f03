//! In-memory authoritative ledger, balances, and their single mutation path.

/// Cached per-user balances.
pub mod balance;
/// Helper index aliases.
pub mod indices;
/// Append-only ledger with user and order indices.
pub mod ledger;
/// Wallet store binding ledger and balances.
pub mod store;
