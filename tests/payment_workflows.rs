use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

use tokenwallet::{
    clock::ManualClock,
    config::{ConfigError, WalletConfig},
    core::store::WalletStore,
    entry::LedgerEntry,
    error::WalletError,
    lock::{LockService, MemoryLockService},
    orders::{MemoryOrderBook, NewOrder, Order, OrderBook, OrderBookError, OrderMeta},
    persist::{JournalSink, PersistError, PersistResult},
    rate::{NoConversion, Pricing, Rate, RateTable},
    runtime::handle::{AckMode, RuntimeConfig, RuntimeError, WalletHandle, spawn_wallet},
    types::{EntryId, LedgerKind, OrderId, OrderStatus, UserId},
    workflow::{CreditOutcome, PaymentSettings, SkipReason, TokenPayments, TopupRequest},
};

const TOPUP_PRODUCT: u64 = 500;

fn dec(raw: &str) -> Decimal {
    Decimal::from_str(raw).expect("decimal")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Order book whose saves can be made to fail.
#[derive(Default)]
struct FlakyOrderBook {
    inner: MemoryOrderBook,
    fail_saves: AtomicBool,
}

impl OrderBook for FlakyOrderBook {
    fn load(&self, id: OrderId) -> Result<Order, OrderBookError> {
        self.inner.load(id)
    }

    fn save(&self, order: &Order) -> Result<(), OrderBookError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(OrderBookError::Storage("database gone away".to_string()));
        }
        self.inner.save(order)
    }

    fn create(&self, order: NewOrder) -> Result<Order, OrderBookError> {
        self.inner.create(order)
    }
}

/// Journal that refuses writes while `failing` is set.
struct UnreliableJournal {
    failing: Arc<AtomicBool>,
}

impl JournalSink for UnreliableJournal {
    fn append_entries(&mut self, entries: &[LedgerEntry]) -> PersistResult<EntryId> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Message("journal offline".to_string()));
        }
        Ok(entries.last().map(|e| e.id).unwrap_or(0))
    }
}

struct Fixture {
    payments: TokenPayments,
    wallet: WalletHandle,
    orders: Arc<FlakyOrderBook>,
    locks: Arc<MemoryLockService>,
    clock: Arc<ManualClock>,
}

impl Fixture {
    fn with_pricing(pricing: Pricing) -> Self {
        Self::with_journal(pricing, None)
    }

    fn with_journal(pricing: Pricing, journal: Option<Box<dyn JournalSink>>) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let wallet = spawn_wallet(WalletStore::with_clock(clock.clone()), journal, RuntimeConfig::default());
        let orders = Arc::new(FlakyOrderBook::default());
        let locks = Arc::new(MemoryLockService::new(clock.clone()));
        let settings = PaymentSettings {
            spend_lock_ttl: Duration::from_secs(45),
            topup_product_id: Some(TOPUP_PRODUCT),
        };
        let payments = TokenPayments::new(wallet.clone(), orders.clone(), locks.clone(), pricing, settings);
        Self {
            payments,
            wallet,
            orders,
            locks,
            clock,
        }
    }

    fn new(price: &str) -> Self {
        Self::with_pricing(Pricing::new(Rate::new(dec(price)), "EUR"))
    }

    fn order(&self, id: OrderId, customer: Option<UserId>, total: &str, currency: &str) -> Order {
        let order = Order {
            id,
            customer_id: customer,
            total: dec(total),
            currency: currency.to_string(),
            status: OrderStatus::Pending,
            needs_processing: false,
            product_id: None,
            meta: OrderMeta::default(),
            notes: Vec::new(),
        };
        self.orders.inner.insert(order.clone());
        order
    }

    fn reload(&self, id: OrderId) -> Order {
        self.orders.load(id).expect("order")
    }

    async fn fund(&self, user: UserId, tokens: i64) {
        self.payments.adjust(user, tokens, "seed", 1).await.expect("fund");
    }

    async fn spend_entries(&self, user: UserId) -> usize {
        self.payments
            .history(user, 100, 0)
            .await
            .expect("history")
            .iter()
            .filter(|e| e.kind == LedgerKind::Spend)
            .count()
    }
}

#[tokio::test]
async fn completed_topup_order_credits_its_tokens() {
    let fx = Fixture::new("1");
    let order = fx
        .payments
        .create_topup_order(7, TopupRequest::Tokens(100))
        .expect("create");
    assert_eq!(order.total, dec("100"));
    assert_eq!(order.currency, "EUR");
    assert_eq!(order.product_id, Some(TOPUP_PRODUCT));
    assert!(order.meta.is_topup);
    assert_eq!(order.meta.tokens_qty, 100);
    assert_eq!(fx.payments.balance(7).await.expect("balance"), 0);

    let outcome = fx
        .payments
        .on_status_changed(order.id, OrderStatus::Completed)
        .await
        .expect("credit")
        .expect("paid status");
    assert!(matches!(outcome, CreditOutcome::Credited { tokens: 100, .. }));
    assert_eq!(fx.payments.balance(7).await.expect("balance"), 100);

    let history = fx.payments.history(7, 10, 0).await.expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, LedgerKind::Topup);
    assert_eq!(history[0].tokens, 100);
    assert_eq!(history[0].order_id, Some(order.id));
    assert_eq!(history[0].note, "Token top-up via order");

    let saved = fx.reload(order.id);
    assert!(saved.meta.tokens_credited);
    assert_eq!(saved.notes, vec!["Credited 100 tokens to user #7".to_string()]);

    // Processing after Completed, as some hosts fire both hooks.
    let again = fx
        .payments
        .on_status_changed(order.id, OrderStatus::Processing)
        .await
        .expect("repeat");
    assert_eq!(again, Some(CreditOutcome::AlreadyCredited));
    assert_eq!(fx.payments.balance(7).await.expect("balance"), 100);
}

#[tokio::test]
async fn unpaid_statuses_do_not_credit() {
    let fx = Fixture::new("1");
    let order = fx
        .payments
        .create_topup_order(7, TopupRequest::Tokens(5))
        .expect("create");
    for status in [OrderStatus::Pending, OrderStatus::Cancelled, OrderStatus::Failed] {
        assert_eq!(
            fx.payments.on_status_changed(order.id, status).await.expect("hook"),
            None
        );
    }
    assert_eq!(fx.payments.balance(7).await.expect("balance"), 0);
}

#[tokio::test]
async fn credit_skips_orders_it_cannot_credit() {
    let fx = Fixture::new("1");

    let plain = fx.order(1, Some(3), "10", "EUR");
    assert_eq!(
        fx.payments.credit(plain.id).await.expect("plain"),
        CreditOutcome::Skipped(SkipReason::NotTopup)
    );

    let mut guest = fx.order(2, None, "10", "EUR");
    guest.meta.is_topup = true;
    guest.meta.tokens_qty = 10;
    fx.orders.inner.insert(guest);
    assert_eq!(
        fx.payments.credit(2).await.expect("guest"),
        CreditOutcome::Skipped(SkipReason::NoPayer)
    );

    let mut empty = fx.order(3, Some(3), "10", "EUR");
    empty.meta.is_topup = true;
    fx.orders.inner.insert(empty);
    assert_eq!(
        fx.payments.credit(3).await.expect("empty"),
        CreditOutcome::Skipped(SkipReason::NoQuantity)
    );

    assert!(fx.payments.history(3, 10, 0).await.expect("history").is_empty());
}

#[tokio::test]
async fn failed_credit_is_noted_on_the_order() {
    let fx = Fixture::new("1");
    fx.fund(8, i64::MAX).await;
    let order = fx
        .payments
        .create_topup_order(8, TopupRequest::Tokens(1))
        .expect("create");

    let err = fx.payments.credit(order.id).await.expect_err("overflow");
    assert!(matches!(err, WalletError::CreditFailure { order_id, .. } if order_id == order.id));

    let saved = fx.reload(order.id);
    assert!(!saved.meta.tokens_credited);
    assert!(saved.notes[0].starts_with("Token credit failed: "));
    assert_eq!(fx.payments.balance(8).await.expect("balance"), i64::MAX);
}

#[tokio::test]
async fn ledger_entry_without_flag_is_treated_as_credited() {
    let fx = Fixture::new("1");
    let order = fx
        .payments
        .create_topup_order(9, TopupRequest::Tokens(12))
        .expect("create");
    fx.payments.credit(order.id).await.expect("credit");

    // Host lost the flag write.
    let mut lost = fx.reload(order.id);
    lost.meta.tokens_credited = false;
    fx.orders.inner.insert(lost);

    assert_eq!(
        fx.payments.credit(order.id).await.expect("retry"),
        CreditOutcome::AlreadyCredited
    );
    assert!(fx.reload(order.id).meta.tokens_credited);
    assert_eq!(fx.payments.balance(9).await.expect("balance"), 12);
}

#[tokio::test]
async fn paying_with_tokens_debits_once_and_completes_the_order() {
    let fx = Fixture::new("1");
    fx.fund(5, 100).await;
    let order = fx.order(20, Some(5), "30", "EUR");

    let receipt = fx.payments.pay(order.id).await.expect("pay");
    assert_eq!(receipt.tokens_spent, 30);
    assert!(!receipt.already_paid);
    assert!(receipt.entry_id.is_some());
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 70);

    let saved = fx.reload(order.id);
    assert!(saved.meta.tokens_spent);
    assert_eq!(saved.meta.tokens_spent_qty, Some(30));
    assert_eq!(saved.status, OrderStatus::Completed);
    assert_eq!(
        saved.notes,
        vec!["Paid with tokens.".to_string(), "Spent 30 tokens from user #5".to_string()]
    );

    let entry = fx
        .wallet
        .entry_for_order(LedgerKind::Spend, order.id)
        .await
        .expect("lookup")
        .expect("entry");
    assert_eq!(entry.tokens, -30);
    assert_eq!(entry.note, "Paid with tokens");
    assert_eq!(entry.meta["needed_tokens"], 30);
    assert_eq!(entry.meta["currency"], "EUR");

    let replay = fx.payments.pay(order.id).await.expect("second pay");
    assert!(replay.already_paid);
    assert_eq!(replay.tokens_spent, 30);
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 70);
    assert_eq!(fx.spend_entries(5).await, 1);
}

#[tokio::test]
async fn orders_with_physical_goods_move_to_processing() {
    let fx = Fixture::new("0.5");
    fx.fund(5, 100).await;
    let mut order = fx.order(21, Some(5), "10.25", "EUR");
    order.needs_processing = true;
    fx.orders.inner.insert(order);

    let receipt = fx.payments.pay(21).await.expect("pay");
    assert_eq!(receipt.tokens_spent, 21);
    assert_eq!(fx.reload(21).status, OrderStatus::Processing);
}

#[tokio::test]
async fn insufficient_balance_leaves_everything_untouched() {
    let fx = Fixture::new("1");
    fx.fund(6, 10).await;
    let order = fx.order(30, Some(6), "30", "EUR");

    let err = fx.payments.pay(order.id).await.expect_err("too poor");
    assert!(matches!(
        err,
        WalletError::InsufficientBalance {
            needed: 30,
            available: 10
        }
    ));
    assert_eq!(err.to_string(), "not enough tokens: need 30, you have 10");
    assert_eq!(fx.payments.balance(6).await.expect("balance"), 10);
    assert_eq!(fx.spend_entries(6).await, 0);
    assert!(!fx.reload(order.id).meta.tokens_spent);
    assert!(!fx.locks.is_held("spend:30"));
}

#[tokio::test]
async fn pay_rejects_guests_topups_and_unknown_orders() {
    let fx = Fixture::new("1");
    fx.fund(4, 100).await;

    fx.order(40, None, "5", "EUR");
    assert!(matches!(fx.payments.pay(40).await, Err(WalletError::InvalidInput(_))));
    fx.order(41, Some(0), "5", "EUR");
    assert!(matches!(fx.payments.pay(41).await, Err(WalletError::InvalidInput(_))));

    let topup = fx
        .payments
        .create_topup_order(4, TopupRequest::Tokens(5))
        .expect("create");
    assert!(matches!(
        fx.payments.pay(topup.id).await,
        Err(WalletError::InvalidOperation(_))
    ));

    assert!(matches!(fx.payments.pay(999).await, Err(WalletError::InvalidInput(_))));

    fx.order(50, Some(4), "0", "EUR");
    assert!(matches!(fx.payments.pay(50).await, Err(WalletError::InvalidInput(_))));

    assert_eq!(fx.payments.balance(4).await.expect("balance"), 100);
}

#[tokio::test]
async fn busy_spend_lock_fails_fast_until_it_expires() {
    let fx = Fixture::new("1");
    fx.fund(5, 100).await;
    fx.order(50, Some(5), "20", "EUR");

    assert!(fx.locks.try_acquire("spend:50", Duration::from_secs(45)).is_some());
    let err = fx.payments.pay(50).await.expect_err("busy");
    assert!(matches!(err, WalletError::PaymentInProgress { order_id: 50 }));
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 100);

    fx.clock.advance_ms(46_000);
    let receipt = fx.payments.pay(50).await.expect("after expiry");
    assert_eq!(receipt.tokens_spent, 20);
    assert!(!fx.locks.is_held("spend:50"));
}

#[tokio::test]
async fn busy_lock_on_a_paid_order_reports_success() {
    let fx = Fixture::new("1");
    fx.fund(5, 100).await;
    fx.order(51, Some(5), "20", "EUR");

    // Another attempt finished the debit but still holds the lock.
    fx.payments.pay(51).await.expect("first");
    assert!(fx.locks.try_acquire("spend:51", Duration::from_secs(45)).is_some());

    let receipt = fx.payments.pay(51).await.expect("second");
    assert!(receipt.already_paid);
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 80);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_payments_for_one_order_debit_once() {
    let fx = Fixture::new("1");
    fx.fund(5, 1_000).await;
    fx.order(60, Some(5), "30", "EUR");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let payments = fx.payments.clone();
        tasks.push(tokio::spawn(async move { payments.pay(60).await }));
    }
    for task in tasks {
        match task.await.expect("join") {
            Ok(receipt) => assert_eq!(receipt.tokens_spent, 30),
            Err(WalletError::PaymentInProgress { order_id }) => assert_eq!(order_id, 60),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(fx.payments.balance(5).await.expect("balance"), 970);
    assert_eq!(fx.spend_entries(5).await, 1);
    assert!(fx.reload(60).meta.tokens_spent);
}

#[tokio::test]
async fn retry_after_failed_order_save_does_not_debit_twice() {
    let fx = Fixture::new("1");
    fx.fund(5, 100).await;
    fx.order(70, Some(5), "25", "EUR");

    fx.orders.fail_saves.store(true, Ordering::SeqCst);
    let err = fx.payments.pay(70).await.expect_err("save fails");
    assert!(matches!(err, WalletError::Orders(OrderBookError::Storage(_))));
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 75);
    assert!(!fx.reload(70).meta.tokens_spent);

    fx.orders.fail_saves.store(false, Ordering::SeqCst);
    let receipt = fx.payments.pay(70).await.expect("retry");
    assert!(receipt.already_paid);
    assert_eq!(receipt.tokens_spent, 25);
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 75);
    assert_eq!(fx.spend_entries(5).await, 1);
    assert_eq!(fx.reload(70).meta.tokens_spent_qty, Some(25));
}

#[tokio::test]
async fn payment_failing_in_the_journal_debits_nothing_and_retries_cleanly() {
    let failing = Arc::new(AtomicBool::new(false));
    let journal = UnreliableJournal {
        failing: Arc::clone(&failing),
    };
    let fx = Fixture::with_journal(Pricing::new(Rate::new(dec("1")), "EUR"), Some(Box::new(journal)));
    fx.fund(5, 100).await;
    fx.order(71, Some(5), "25", "EUR");

    failing.store(true, Ordering::SeqCst);
    let err = fx.payments.pay(71).await.expect_err("journal offline");
    assert!(matches!(err, WalletError::Runtime(RuntimeError::Persist(_))));
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 100);
    assert_eq!(fx.spend_entries(5).await, 0);
    assert!(!fx.reload(71).meta.tokens_spent);
    assert!(!fx.locks.is_held("spend:71"));

    failing.store(false, Ordering::SeqCst);
    let receipt = fx.payments.pay(71).await.expect("retry");
    assert!(!receipt.already_paid);
    assert!(receipt.entry_id.is_some());
    assert_eq!(receipt.tokens_spent, 25);
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 75);
    assert_eq!(fx.spend_entries(5).await, 1);
}

#[tokio::test]
async fn foreign_currency_orders_are_converted_first() {
    let table = RateTable::new().with_rate("USD", dec("1.25"));
    let fx = Fixture::with_pricing(Pricing::new(Rate::new(dec("0.5")), "EUR").with_conversion(Arc::new(table)));
    fx.fund(5, 100).await;
    fx.order(80, Some(5), "10.05", "USD");

    // 10.05 USD = 8.04 EUR = 16.08 tokens at 0.5, rounded up.
    let receipt = fx.payments.pay(80).await.expect("pay");
    assert_eq!(receipt.tokens_spent, 17);

    let entry = fx
        .wallet
        .entry_for_order(LedgerKind::Spend, 80)
        .await
        .expect("lookup")
        .expect("entry");
    assert_eq!(entry.meta["currency"], "USD");
    assert_eq!(entry.meta["reference_currency"], "EUR");
    assert_eq!(entry.meta["order_total"], "10.05");
}

#[tokio::test]
async fn topup_by_amount_rounds_tokens_down() {
    let fx = Fixture::new("3");

    let order = fx
        .payments
        .create_topup_order(
            5,
            TopupRequest::Amount {
                amount: dec("10"),
                currency: "EUR".to_string(),
            },
        )
        .expect("create");
    assert_eq!(order.meta.tokens_qty, 3);
    assert_eq!(order.total, dec("10"));

    let err = fx
        .payments
        .create_topup_order(
            5,
            TopupRequest::Amount {
                amount: dec("2.99"),
                currency: "EUR".to_string(),
            },
        )
        .expect_err("too small");
    assert_eq!(
        err.to_string(),
        "invalid input: Amount is too low to receive at least 1 token"
    );

    let err = fx
        .payments
        .create_topup_order(
            5,
            TopupRequest::Amount {
                amount: Decimal::ZERO,
                currency: "EUR".to_string(),
            },
        )
        .expect_err("zero");
    assert_eq!(err.to_string(), "invalid input: Invalid amount");

    assert!(matches!(
        fx.payments.create_topup_order(0, TopupRequest::Tokens(1)),
        Err(WalletError::InvalidInput(_))
    ));
    assert!(matches!(
        fx.payments.create_topup_order(5, TopupRequest::Tokens(0)),
        Err(WalletError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn admin_adjustments_are_validated_and_audited() {
    let fx = Fixture::new("1");

    assert!(matches!(
        fx.payments.adjust(0, 5, "x", 1).await,
        Err(WalletError::InvalidInput(_))
    ));
    assert!(matches!(
        fx.payments.adjust(5, 0, "x", 1).await,
        Err(WalletError::InvalidInput(_))
    ));
    assert!(matches!(
        fx.payments.adjust(5, -1, "x", 1).await,
        Err(WalletError::InsufficientBalance {
            needed: 1,
            available: 0
        })
    ));

    let entry = fx
        .payments
        .adjust(5, 15, "compensation", 2)
        .await
        .expect("adjust");
    assert_eq!(entry.kind, LedgerKind::AdminAdjust);
    assert_eq!(entry.order_id, None);
    assert_eq!(entry.note, "compensation");
    assert_eq!(entry.meta["admin_id"], 2);
    assert_eq!(entry.meta["old_balance"], 0);
    assert_eq!(entry.meta["new_balance"], 15);

    fx.payments.adjust(5, -15, "reversal", 2).await.expect("reverse");
    assert_eq!(fx.payments.balance(5).await.expect("balance"), 0);
}

#[tokio::test]
async fn spend_quote_reports_shortfall() {
    let fx = Fixture::new("2");
    fx.fund(5, 4).await;

    let quote = fx
        .payments
        .spend_quote(5, dec("9"), "EUR")
        .await
        .expect("quote");
    assert_eq!((quote.needed, quote.available, quote.sufficient), (5, 4, false));

    let quote = fx
        .payments
        .spend_quote(5, dec("8"), "EUR")
        .await
        .expect("quote");
    assert!(quote.sufficient);
}

#[tokio::test]
async fn service_can_be_wired_from_toml() {
    let config = WalletConfig::from_toml_str(
        r#"
        token_price = "0.5"
        reference_currency = "USD"
        topup_product_id = 42
        spend_lock_ttl_secs = 10

        [runtime]
        ack_mode = "in_memory"
        batch_max_ops = 8
        "#,
    )
    .expect("config");
    assert_eq!(config.rate().price(), dec("0.5"));
    assert_eq!(config.spend_lock_ttl(), Duration::from_secs(10));
    assert_eq!(config.runtime.ack_mode, AckMode::InMemory);
    assert_eq!(config.runtime.batch_max_ops, 8);
    assert_eq!(config.runtime.command_queue_bound, 256);
    assert!(config.database_path.is_none());

    let wallet = spawn_wallet(WalletStore::new(), None, config.runtime.clone());
    let clock = Arc::new(ManualClock::new(0));
    let payments = TokenPayments::from_config(
        &config,
        wallet.clone(),
        Arc::new(MemoryOrderBook::new()),
        Arc::new(MemoryLockService::new(clock)),
        Arc::new(NoConversion),
    );
    let order = payments
        .create_topup_order(3, TopupRequest::Tokens(4))
        .expect("create");
    assert_eq!(order.total, dec("2"));
    assert_eq!(order.currency, "USD");
    assert_eq!(order.product_id, Some(42));
    wallet.shutdown().await.expect("shutdown");
}

#[test]
fn bad_config_is_reported() {
    assert!(matches!(
        WalletConfig::from_toml_str("token_price = ["),
        Err(ConfigError::Toml(_))
    ));
    assert!(matches!(
        WalletConfig::load("/nonexistent/wallet.toml"),
        Err(ConfigError::Io { .. })
    ));

    let defaults = WalletConfig::from_toml_str("").expect("empty");
    assert_eq!(defaults.rate(), Rate::default());
    assert_eq!(defaults.reference_currency, "EUR");
    assert_eq!(defaults.spend_lock_ttl(), Duration::from_secs(45));

    let misconfigured = WalletConfig::from_toml_str(r#"token_price = "-1""#).expect("negative");
    assert_eq!(misconfigured.rate(), Rate::default());
}
