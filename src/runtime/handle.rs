use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{error, info, warn};

use crate::{
    config::WalletConfig,
    core::store::{StoreError, WalletStore},
    entry::{EntryDraft, LedgerEntry},
    persist::{JournalSink, PersistError, PersistResult, sqlite::SqliteJournal},
    types::{EntryId, LedgerKind, OrderId, UserId},
};

use super::events::WalletEvent;

/// Failures surfaced through [`WalletHandle`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The store refused the change.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The journal failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The runtime task is gone.
    #[error("wallet runtime is not running")]
    ChannelClosed,
}

/// When a change is acknowledged to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// As soon as the in-memory store accepted it.
    InMemory,
    /// Once the journal committed it.
    #[default]
    Durable,
}

/// Tuning for the runtime loop and its persistence worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Acknowledgement policy for changes.
    pub ack_mode: AckMode,
    /// Entries buffered before the worker writes a batch.
    pub batch_max_ops: usize,
    /// Longest time an entry waits in the buffer.
    pub batch_max_latency_ms: u64,
    /// Capacity of the runtime to worker queue.
    pub persist_queue_bound: usize,
    /// Capacity of the caller to runtime queue.
    pub command_queue_bound: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::Durable,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            command_queue_bound: 256,
        }
    }
}

/// Cloneable front end of the wallet runtime.
///
/// Every balance change for every user funnels through one task, so concurrent requests can
/// never interleave the read and the write of a balance.
#[derive(Clone)]
pub struct WalletHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<WalletEvent>,
}

enum Command {
    Change {
        draft: EntryDraft,
        resp: oneshot::Sender<Result<LedgerEntry, RuntimeError>>,
    },
    Balance {
        user_id: UserId,
        resp: oneshot::Sender<i64>,
    },
    History {
        user_id: UserId,
        limit: usize,
        offset: usize,
        resp: oneshot::Sender<Vec<LedgerEntry>>,
    },
    EntryForOrder {
        kind: LedgerKind,
        order_id: OrderId,
        resp: oneshot::Sender<Option<LedgerEntry>>,
    },
    Flush {
        resp: oneshot::Sender<Result<EntryId, RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    Entries(Vec<LedgerEntry>),
    Flush {
        resp: oneshot::Sender<Result<EntryId, PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<EntryId, PersistError>>,
    },
}

/// Opens the journal named by `config`, replays it, and spawns the runtime.
///
/// Must be called from inside a tokio runtime.
pub fn start_wallet(config: &WalletConfig) -> PersistResult<WalletHandle> {
    let journal = match &config.database_path {
        Some(path) => SqliteJournal::open(path)?,
        None => SqliteJournal::open_in_memory()?,
    };
    let store = journal.load_store()?;
    info!(entries = store.ledger().len(), "wallet runtime starting");
    Ok(spawn_wallet(store, Some(Box::new(journal)), config.runtime.clone()))
}

/// Spawns the single-writer loop over `store`, journaling into `sink` when given.
///
/// With [`AckMode::Durable`] a change reaches the store only after the journal committed it. With
/// [`AckMode::InMemory`] it is acknowledged first and journaled in the background; while the
/// journal is failing, further changes are refused until a write succeeds again.
pub fn spawn_wallet(
    store: WalletStore,
    sink: Option<Box<dyn JournalSink>>,
    config: RuntimeConfig,
) -> WalletHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<WalletEvent>(1024);

    let (persist_tx, reports) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel::<Result<EntryId, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, reports_tx, &config);
        (Some(persist_tx), Some(reports_rx))
    } else {
        (None, None)
    };

    let mut runtime = Runtime {
        store,
        events_tx: events_tx.clone(),
        persist_tx,
        reports,
        config,
        journal_failure: None,
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break; };
                    if runtime.handle_command(cmd).await {
                        break;
                    }
                }
                report = next_report(&mut runtime.reports) => match report {
                    Some(report) => runtime.note_journal_report(report),
                    None => runtime.reports = None,
                },
            }
        }
    });

    WalletHandle { cmd_tx, events_tx }
}

impl WalletHandle {
    /// Subscribes to committed-change and durability events.
    pub fn subscribe(&self) -> broadcast::Receiver<WalletEvent> {
        self.events_tx.subscribe()
    }

    /// Applies a balance change. See [`WalletStore::change`].
    pub async fn change(&self, draft: EntryDraft) -> Result<LedgerEntry, RuntimeError> {
        self.call(|resp| Command::Change { draft, resp }).await?
    }

    /// Current balance of `user_id`.
    pub async fn balance(&self, user_id: UserId) -> Result<i64, RuntimeError> {
        self.call(|resp| Command::Balance { user_id, resp }).await
    }

    /// Ledger entries of `user_id`, newest first.
    pub async fn history(&self, user_id: UserId, limit: usize, offset: usize) -> Result<Vec<LedgerEntry>, RuntimeError> {
        self.call(|resp| Command::History {
            user_id,
            limit,
            offset,
            resp,
        })
        .await
    }

    /// The top-up or spend entry already recorded for `order_id`.
    pub async fn entry_for_order(&self, kind: LedgerKind, order_id: OrderId) -> Result<Option<LedgerEntry>, RuntimeError> {
        self.call(|resp| Command::EntryForOrder { kind, order_id, resp })
            .await
    }

    /// Waits until everything committed so far is durable.
    pub async fn flush(&self) -> Result<EntryId, RuntimeError> {
        self.call(|resp| Command::Flush { resp }).await?
    }

    /// Drains the journal and stops the runtime.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.call(|resp| Command::Shutdown { resp }).await?
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }
}

struct Runtime {
    store: WalletStore,
    events_tx: broadcast::Sender<WalletEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    reports: Option<mpsc::UnboundedReceiver<Result<EntryId, PersistError>>>,
    config: RuntimeConfig,
    /// Last journal error while entries acknowledged in memory are still unwritten.
    journal_failure: Option<String>,
}

impl Runtime {
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Change { draft, resp } => {
                let res = self.apply_change(draft).await;
                let _ = resp.send(res);
            }
            Command::Balance { user_id, resp } => {
                let _ = resp.send(self.store.balance(user_id));
            }
            Command::History {
                user_id,
                limit,
                offset,
                resp,
            } => {
                let _ = resp.send(self.store.ledger().list_for_user_cloned(user_id, limit, offset));
            }
            Command::EntryForOrder { kind, order_id, resp } => {
                let _ = resp.send(self.store.ledger().entry_for_order(kind, order_id).cloned());
            }
            Command::Flush { resp } => {
                let out = match self.persist_tx.clone() {
                    Some(tx) => {
                        let out = request_flush(&tx).await;
                        // Every write the flush waited on has reported by now.
                        self.drain_reports();
                        out
                    }
                    None => Ok(self.store.latest_entry_id()),
                };
                let _ = resp.send(out);
            }
            Command::Shutdown { resp } => {
                let out = match &self.persist_tx {
                    Some(tx) => shutdown_journal(tx).await,
                    None => Ok(()),
                };
                let _ = resp.send(out);
                return true;
            }
        }

        false
    }

    async fn apply_change(&mut self, draft: EntryDraft) -> Result<LedgerEntry, RuntimeError> {
        let entry = match (self.persist_tx.clone(), self.config.ack_mode) {
            (Some(tx), AckMode::Durable) => {
                let entry = self.store.prepare(draft)?;
                journal_durably(&tx, &entry).await?;
                if let Err(err) = self.store.commit(entry.clone()) {
                    error!(entry_id = entry.id, error = %err, "journaled entry could not be applied in memory");
                    return Err(err.into());
                }
                entry
            }
            (Some(tx), AckMode::InMemory) => {
                if let Some(reason) = &self.journal_failure {
                    return Err(RuntimeError::Persist(PersistError::Message(format!(
                        "journal unavailable, change refused: {reason}"
                    ))));
                }
                let entry = self.store.change(draft)?;
                tx.send(PersistMsg::Entries(self.store.drain_pending_entries()))
                    .await
                    .map_err(|_| RuntimeError::ChannelClosed)?;
                entry
            }
            (None, _) => {
                let entry = self.store.change(draft)?;
                self.store.drain_pending_entries();
                let _ = self.events_tx.send(WalletEvent::DurableUpTo { entry_id: entry.id });
                entry
            }
        };

        let _ = self.events_tx.send(WalletEvent::EntryAppended {
            entry_id: entry.id,
            user_id: entry.user_id,
            kind: entry.kind,
            tokens: entry.tokens,
            order_id: entry.order_id,
            balance: self.store.balance(entry.user_id),
        });
        Ok(entry)
    }

    fn note_journal_report(&mut self, report: Result<EntryId, PersistError>) {
        match report {
            Ok(entry_id) => {
                if self.journal_failure.take().is_some() {
                    info!(entry_id, "journal caught up");
                }
                let _ = self.events_tx.send(WalletEvent::DurableUpTo { entry_id });
            }
            Err(err) => self.journal_failure = Some(err.to_string()),
        }
    }

    fn drain_reports(&mut self) {
        while let Some(report) = self.reports.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.note_journal_report(report);
        }
    }
}

async fn next_report(
    reports: &mut Option<mpsc::UnboundedReceiver<Result<EntryId, PersistError>>>,
) -> Option<Result<EntryId, PersistError>> {
    match reports {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn journal_durably(tx: &mpsc::Sender<PersistMsg>, entry: &LedgerEntry) -> Result<(), RuntimeError> {
    tx.send(PersistMsg::Entries(vec![entry.clone()]))
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
    let durable = request_flush(tx).await?;
    if durable < entry.id {
        error!(entry_id = entry.id, durable, "entry not journaled, change dropped");
        return Err(RuntimeError::Persist(PersistError::Message(format!(
            "entry #{} not journaled (durable up to #{durable})",
            entry.id
        ))));
    }
    Ok(())
}

async fn request_flush(tx: &mpsc::Sender<PersistMsg>) -> Result<EntryId, RuntimeError> {
    let (flush_tx, flush_rx) = oneshot::channel();
    tx.send(PersistMsg::Flush { resp: flush_tx })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
    flush_rx
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?
        .map_err(RuntimeError::from)
}

async fn shutdown_journal(tx: &mpsc::Sender<PersistMsg>) -> Result<(), RuntimeError> {
    let (done_tx, done_rx) = oneshot::channel();
    tx.send(PersistMsg::Shutdown { resp: done_tx })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
    done_rx.await.map_err(|_| RuntimeError::ChannelClosed)??;
    Ok(())
}

/// Owns the sink on the journal task and the entries not yet written.
struct JournalWorker {
    sink: Arc<Mutex<Box<dyn JournalSink>>>,
    buf: Vec<LedgerEntry>,
    durable: EntryId,
    reports: mpsc::UnboundedSender<Result<EntryId, PersistError>>,
    /// Entries were already acknowledged to callers and must survive a failed write.
    retain_failed: bool,
}

impl JournalWorker {
    /// Writes the buffer as one batch. On failure the batch goes back to the front of the buffer
    /// when `retain_failed` is set and is discarded otherwise.
    async fn write(&mut self, checkpoint: bool) -> Result<EntryId, PersistError> {
        if self.buf.is_empty() {
            if checkpoint {
                self.checkpoint().await;
            }
            return Ok(self.durable);
        }

        let batch = std::mem::take(&mut self.buf);
        let first_entry_id = batch.first().map(|e| e.id).unwrap_or(0);
        let last_entry_id = batch.last().map(|e| e.id).unwrap_or(0);
        let sink = Arc::clone(&self.sink);
        let (batch, appended) = tokio::task::spawn_blocking(move || {
            let appended = sink.blocking_lock().append_entries(&batch);
            (batch, appended)
        })
        .await
        .map_err(|e| {
            error!(first_entry_id, last_entry_id, error = %e, "journal task died, batch lost");
            let reason = format!("journal task failed: {e}");
            let _ = self.reports.send(Err(PersistError::Message(reason.clone())));
            PersistError::Message(reason)
        })?;

        match appended {
            Ok(entry_id) => {
                self.durable = self.durable.max(entry_id);
                let _ = self.reports.send(Ok(self.durable));
                if checkpoint {
                    self.checkpoint().await;
                }
                Ok(self.durable)
            }
            Err(err) => {
                error!(
                    first_entry_id,
                    last_entry_id,
                    retained = self.retain_failed,
                    error = %err,
                    "journal write failed"
                );
                let _ = self.reports.send(Err(PersistError::Message(err.to_string())));
                if self.retain_failed {
                    let newer = std::mem::replace(&mut self.buf, batch);
                    self.buf.extend(newer);
                }
                Err(err)
            }
        }
    }

    /// Flushes the sink. Committed batches are already durable, so a failure is only logged.
    async fn checkpoint(&self) {
        let sink = Arc::clone(&self.sink);
        let res = tokio::task::spawn_blocking(move || sink.blocking_lock().flush()).await;
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "journal checkpoint failed"),
            Err(err) => warn!(error = %err, "journal checkpoint task died"),
        }
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn JournalSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    reports: mpsc::UnboundedSender<Result<EntryId, PersistError>>,
    config: &RuntimeConfig,
) {
    let mut worker = JournalWorker {
        sink: Arc::new(Mutex::new(sink)),
        buf: Vec::new(),
        durable: 0,
        reports,
        retain_failed: config.ack_mode == AckMode::InMemory,
    };
    let batch_max_ops = config.batch_max_ops.max(1);
    let latency = Duration::from_millis(config.batch_max_latency_ms);

    tokio::spawn(async move {
        let mut deadline = Instant::now() + latency;

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(PersistMsg::Entries(entries)) => {
                        worker.buf.extend(entries);
                        if worker.buf.len() >= batch_max_ops {
                            // Failures are logged and reported by `write`; retained entries retry on the timer.
                            let _ = worker.write(false).await;
                            deadline = Instant::now() + latency;
                        }
                    }
                    Some(PersistMsg::Flush { resp }) => {
                        let _ = resp.send(worker.write(true).await);
                        deadline = Instant::now() + latency;
                    }
                    Some(PersistMsg::Shutdown { resp }) => {
                        let _ = resp.send(worker.write(true).await);
                        break;
                    }
                    None => {
                        let _ = worker.write(true).await;
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline), if !worker.buf.is_empty() => {
                    let _ = worker.write(false).await;
                    deadline = Instant::now() + latency;
                }
            }
        }

        if !worker.buf.is_empty() {
            error!(
                unwritten = worker.buf.len(),
                first_entry_id = worker.buf[0].id,
                "journal stopped with entries not written"
            );
        }
    });
}
