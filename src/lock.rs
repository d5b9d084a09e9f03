//! Short-lived keyed locks guarding order payment.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use hashbrown::HashMap;

use crate::clock::Clock;

/// Identifies one acquisition of a key; only its holder can release it.
pub type LockToken = u64;

/// Set-with-TTL / get / delete primitives keyed by string.
///
/// Implementations must make `try_acquire` an atomic test-and-set: of two concurrent callers at
/// most one gets a token while the key is live.
pub trait LockService: Send + Sync {
    /// Takes `key` for `ttl` unless a live holder exists.
    fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockToken>;
    /// True while `key` is held and not expired.
    fn is_held(&self, key: &str) -> bool;
    /// Drops `key` if `token` still owns it. A holder whose lock expired and was retaken is a no-op.
    fn release(&self, key: &str, token: LockToken);
}

/// Releases its key when dropped.
pub struct LockGuard<'a> {
    locks: &'a dyn LockService,
    key: String,
    token: LockToken,
}

impl<'a> LockGuard<'a> {
    /// Tries to take `key`; `None` when someone else holds it.
    pub fn acquire(locks: &'a dyn LockService, key: impl Into<String>, ttl: Duration) -> Option<Self> {
        let key = key.into();
        let token = locks.try_acquire(&key, ttl)?;
        Some(Self { locks, key, token })
    }

    /// Locked key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.key, self.token);
    }
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: LockToken,
    expires_at: u64,
}

/// In-process lock table with expiry driven by a [`Clock`].
#[derive(Debug)]
pub struct MemoryLockService {
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, Holder>>,
    next_token: AtomicU64,
}

impl MemoryLockService {
    /// Empty table reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            held: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl LockService for MemoryLockService {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockToken> {
        let now = self.clock.now_ms();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(key).is_some_and(|holder| holder.expires_at > now) {
            return None;
        }
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(
            key.to_string(),
            Holder {
                token,
                expires_at: now.saturating_add(ttl_ms),
            },
        );
        Some(token)
    }

    fn is_held(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(key).is_some_and(|holder| holder.expires_at > now)
    }

    fn release(&self, key: &str, token: LockToken) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(key).is_some_and(|holder| holder.token == token) {
            held.remove(key);
        }
    }
}
