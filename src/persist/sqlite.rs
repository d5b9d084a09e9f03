//! SQLite-backed ledger journal with a cached balance table.

use std::path::Path;

use hashbrown::HashMap;
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{info, warn};

use crate::{
    core::store::WalletStore,
    entry::{EntryMeta, LedgerEntry},
    types::{EntryId, LedgerKind, UserId},
};

use super::{JournalSink, PersistError, PersistResult};

const ENTRY_COLUMNS: &str = "id, user_id, kind, tokens, order_id, note, created_at_ms, meta";

/// SQLite implementation of [`crate::persist::JournalSink`].
///
/// Each batch inserts ledger rows and moves the cached balances in one transaction. The balance
/// update is conditional (`balance + delta >= 0`), so the table can never go negative even if
/// two writers share the file.
pub struct SqliteJournal {
    conn: Connection,
}

impl SqliteJournal {
    /// Opens or creates a journal at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory journal.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Rebuilds a store from the full ledger and repairs cached balances that disagree with it.
    pub fn load_store(&self) -> PersistResult<WalletStore> {
        self.load_into(WalletStore::new())
    }

    /// Replays every journaled entry into `store`, which should be empty.
    pub fn load_into(&self, mut store: WalletStore) -> PersistResult<WalletStore> {
        let entries = self.load_entries_after(store.latest_entry_id())?;
        let replayed = entries.len();
        for entry in entries {
            store.apply_replayed_entry(entry)?;
        }
        let repaired = self.reconcile_balances(&store)?;
        info!(replayed, repaired, "ledger journal loaded");
        Ok(store)
    }

    /// Loads entries strictly after `id`, oldest first.
    pub fn load_entries_after(&self, id: EntryId) -> PersistResult<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger WHERE id > ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![id as i64], decode_entry_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Entries for `user_id`, newest first.
    pub fn entries_for_user(&self, user_id: UserId, limit: usize, offset: usize) -> PersistResult<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        // SQLite treats a negative LIMIT as unbounded.
        let limit = i64::try_from(limit).unwrap_or(-1);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![user_id as i64, limit, offset], decode_entry_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Cached balance as stored, zero when absent.
    pub fn balance(&self, user_id: UserId) -> PersistResult<i64> {
        let balance: Option<i64> = self
            .conn
            .query_row(
                "SELECT balance FROM balances WHERE user_id = ?1",
                params![user_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    /// Overwrites cached balances that disagree with the ledger held by `store`.
    ///
    /// Returns how many rows were rewritten.
    pub fn reconcile_balances(&self, store: &WalletStore) -> PersistResult<usize> {
        let mut stored = HashMap::<UserId, i64>::new();
        {
            let mut stmt = self.conn.prepare("SELECT user_id, balance FROM balances")?;
            let rows = stmt.query_map([], |row| {
                let user_id: i64 = row.get(0)?;
                let balance: i64 = row.get(1)?;
                Ok((user_id as UserId, balance))
            })?;
            for row in rows {
                let (user_id, balance) = row?;
                stored.insert(user_id, balance);
            }
        }

        let mut expected = HashMap::<UserId, i64>::new();
        for user_id in store.ledger().users() {
            expected.insert(user_id, store.ledger().sum_for_user(user_id).max(0));
        }
        for user_id in stored.keys() {
            expected.entry(*user_id).or_insert(0);
        }

        let mut repaired = 0;
        for (user_id, want) in expected {
            let have = stored.get(&user_id).copied();
            if have == Some(want) || (have.is_none() && want == 0) {
                continue;
            }
            warn!(user_id, stored = ?have, ledger = want, "cached balance disagrees with ledger, repairing");
            self.conn.execute(
                "INSERT INTO balances(user_id, balance) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET balance = excluded.balance",
                params![user_id as i64, want],
            )?;
            repaired += 1;
        }
        Ok(repaired)
    }

    /// Returns the latest id persisted in the ledger table.
    pub fn latest_entry_id(&self) -> PersistResult<EntryId> {
        let id: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM ledger", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(id.unwrap_or(0) as EntryId)
    }

    /// Drops the ledger and balance tables. Used only when uninstalling.
    pub fn purge(&mut self) -> PersistResult<()> {
        warn!("dropping ledger and balance tables");
        self.conn.execute_batch(
            "DROP TABLE IF EXISTS ledger;
             DROP TABLE IF EXISTS balances;",
        )?;
        Ok(())
    }
}

impl JournalSink for SqliteJournal {
    fn append_entries(&mut self, entries: &[LedgerEntry]) -> PersistResult<EntryId> {
        if entries.is_empty() {
            return self.latest_entry_id();
        }

        let tx = self.conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO ledger(id, user_id, kind, tokens, order_id, note, created_at_ms, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            let mut open_balance =
                tx.prepare("INSERT INTO balances(user_id, balance) VALUES (?1, 0) ON CONFLICT(user_id) DO NOTHING")?;
            let mut move_balance = tx.prepare(
                "UPDATE balances SET balance = balance + ?2 WHERE user_id = ?1 AND balance + ?2 >= 0",
            )?;

            for entry in entries {
                let meta = if entry.meta.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&entry.meta)?)
                };
                insert.execute(params![
                    entry.id as i64,
                    entry.user_id as i64,
                    entry.kind.as_str(),
                    entry.tokens,
                    entry.order_id.map(|v| v as i64),
                    entry.note,
                    entry.created_at_ms as i64,
                    meta,
                ])?;
                open_balance.execute(params![entry.user_id as i64])?;
                if move_balance.execute(params![entry.user_id as i64, entry.tokens])? == 0 {
                    return Err(PersistError::Rejected {
                        entry_id: entry.id,
                        user_id: entry.user_id,
                        tokens: entry.tokens,
                    });
                }
            }
        }
        tx.commit()?;

        Ok(entries.last().map(|e| e.id).unwrap_or(0))
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }
}

fn decode_entry_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let id: i64 = row.get(0)?;
    let user_id: i64 = row.get(1)?;
    let kind_raw: String = row.get(2)?;
    let tokens: i64 = row.get(3)?;
    let order_id: Option<i64> = row.get(4)?;
    let note: String = row.get(5)?;
    let created_at_ms: i64 = row.get(6)?;
    let meta_raw: Option<String> = row.get(7)?;

    let kind = kind_raw.parse::<LedgerKind>().map_err(|err| conversion_error(2, err))?;
    let meta = match meta_raw {
        Some(raw) => serde_json::from_str::<EntryMeta>(&raw).map_err(|err| conversion_error(7, err))?,
        None => EntryMeta::new(),
    };

    Ok(LedgerEntry {
        id: id as EntryId,
        user_id: user_id as UserId,
        kind,
        tokens,
        order_id: order_id.map(|v| v as u64),
        note,
        created_at_ms: created_at_ms as u64,
        meta,
    })
}

fn conversion_error(column: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}
