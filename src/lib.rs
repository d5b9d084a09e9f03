//! Per-user token wallet with an append-only ledger and SQLite journaling.
//!
//! # Examples
//!
//! In-memory usage with [`core::store::WalletStore`]:
//! ```
//! use tokenwallet::{
//!     core::store::{StoreError, WalletStore},
//!     entry::EntryDraft,
//!     types::LedgerKind,
//! };
//!
//! let mut store = WalletStore::new();
//! let entry = store
//!     .change(EntryDraft::new(7, LedgerKind::Topup, 100).with_order(1))
//!     .expect("credit");
//! assert_eq!(entry.id, 1);
//! assert_eq!(store.balance(7), 100);
//!
//! let err = store
//!     .change(EntryDraft::new(7, LedgerKind::AdminAdjust, -101))
//!     .unwrap_err();
//! assert!(matches!(err, StoreError::InsufficientBalance { .. }));
//! assert_eq!(store.balance(7), 100);
//! ```
//!
//! Paying an order through the runtime:
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokenwallet::{
//!     clock::SystemClock,
//!     config::WalletConfig,
//!     lock::MemoryLockService,
//!     orders::MemoryOrderBook,
//!     rate::NoConversion,
//!     runtime::handle::start_wallet,
//!     workflow::TokenPayments,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = WalletConfig::load("wallet.toml").expect("config");
//! let wallet = start_wallet(&config).expect("open journal");
//! let payments = TokenPayments::from_config(
//!     &config,
//!     wallet.clone(),
//!     Arc::new(MemoryOrderBook::new()),
//!     Arc::new(MemoryLockService::new(Arc::new(SystemClock))),
//!     Arc::new(NoConversion),
//! );
//! let receipt = payments.pay(42).await.expect("pay");
//! println!("spent {} tokens", receipt.tokens_spent);
//! wallet.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Time source for entry timestamps and lock expiry.
pub mod clock;
/// TOML configuration.
pub mod config;
/// Core in-memory ledger, balances, and store.
pub mod core;
/// Ledger entry records and drafts.
pub mod entry;
/// Workflow error taxonomy.
pub mod error;
/// Keyed locks with expiry.
pub mod lock;
/// Host order contract and in-memory order book.
pub mod orders;
/// Persistence abstraction and SQLite implementation.
pub mod persist;
/// Token rate and currency conversion.
pub mod rate;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Shared primitive types and enums.
pub mod types;
/// Spend, credit, adjustment, and top-up workflows.
pub mod workflow;
