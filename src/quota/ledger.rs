//! Inflight ledger: byte deltas admitted but not yet visible to metering
//!
//! Each bucket owns one counter guarded by its own mutex, so reservations
//! on a bucket serialize with each other and never with other buckets.
//!
//! Entry lifecycle:
//!
//! ```text
//! reserve ──► Pending ──commit──► Committed ──(window elapsed, flush)──► discarded
//!                │                    │
//!                └────rollback────────┴──► discarded
//! ```
//!
//! A committed entry stays counted until the reconciliation window has
//! passed, because the metering service has not yet observed the completed
//! write. Losing the ledger (restart) only under-counts until metering
//! catches up.

use crate::error::{QuotaError, QuotaResult};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Reference to one ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    bucket: Arc<str>,
    id: u64,
}

impl EntryHandle {
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Live state of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Admitted, operation still running
    Pending,
    /// Operation succeeded; awaiting reconciliation
    Committed { at: Instant },
}

/// One not-yet-confirmed delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflightEntry {
    pub delta_bytes: i64,
    pub created_at: Instant,
    pub state: EntryState,
}

/// A bounded reservation did not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overdraft {
    /// Pending total at the time of the attempt
    pub pending_total: i64,
}

/// Outcome of one reconciliation sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Committed entries discarded after the window
    pub flushed: usize,
    /// Pending entries force-rolled back after exceeding the pending age limit
    pub expired: usize,
    /// Empty bucket counters released
    pub buckets_released: usize,
}

/// Per-bucket tally of unconfirmed deltas
///
/// The evaluator only depends on this trait so the process-local
/// implementation can be replaced by a shared one.
pub trait InflightLedger: Send + Sync {
    /// Add `delta_bytes` to the bucket's pending total unconditionally
    fn reserve(&self, bucket: &str, delta_bytes: i64) -> EntryHandle;

    /// Add `delta_bytes` only if `pending_total + delta_bytes <= headroom`.
    ///
    /// The comparison and the insertion happen under the bucket's lock.
    fn reserve_within(
        &self,
        bucket: &str,
        delta_bytes: i64,
        headroom: i64,
    ) -> Result<EntryHandle, Overdraft>;

    /// Mark the entry's operation as completed; it keeps counting until flushed
    fn commit(&self, handle: &EntryHandle) -> QuotaResult<()>;

    /// Remove the entry immediately
    fn rollback(&self, handle: &EntryHandle) -> QuotaResult<()>;

    /// Sum of all live entries for the bucket
    fn pending_total(&self, bucket: &str) -> i64;

    /// Discard committed entries older than the reconciliation window
    fn flush(&self) -> FlushStats;
}

#[derive(Debug, Default)]
struct BucketLedger {
    entries: BTreeMap<u64, InflightEntry>,
    total: i64,
    /// Set when the counter has been unlinked from the map
    released: bool,
}

impl BucketLedger {
    fn insert(&mut self, id: u64, delta_bytes: i64) {
        self.entries.insert(
            id,
            InflightEntry {
                delta_bytes,
                created_at: Instant::now(),
                state: EntryState::Pending,
            },
        );
        self.total += delta_bytes;
    }
}

/// In-process ledger
#[derive(Debug)]
pub struct LocalLedger {
    buckets: RwLock<HashMap<String, Arc<Mutex<BucketLedger>>>>,
    next_id: AtomicU64,
    reconciliation_window: Duration,
    max_pending_age: Option<Duration>,
}

impl LocalLedger {
    pub fn new(reconciliation_window: Duration) -> Self {
        LocalLedger {
            buckets: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reconciliation_window,
            max_pending_age: None,
        }
    }

    /// Force-rollback pending entries older than `max_pending_age` on flush
    pub fn with_max_pending_age(mut self, max_pending_age: Duration) -> Self {
        self.max_pending_age = Some(max_pending_age);
        self
    }

    pub fn reconciliation_window(&self) -> Duration {
        self.reconciliation_window
    }

    /// Copy of the bucket's live entries, oldest first
    pub fn entries(&self, bucket: &str) -> Vec<InflightEntry> {
        self.existing(bucket)
            .map(|slot| slot.lock().entries.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of buckets with a live counter
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn existing(&self, bucket: &str) -> Option<Arc<Mutex<BucketLedger>>> {
        self.buckets.read().get(bucket).cloned()
    }

    fn slot(&self, bucket: &str) -> Arc<Mutex<BucketLedger>> {
        if let Some(slot) = self.existing(bucket) {
            return slot;
        }
        let mut buckets = self.buckets.write();
        Arc::clone(buckets.entry(bucket.to_string()).or_default())
    }

    /// Run `f` on the bucket's live counter, creating it if needed
    fn with_bucket<R>(&self, bucket: &str, f: impl FnOnce(&mut BucketLedger) -> R) -> R {
        loop {
            let slot = self.slot(bucket);
            let mut ledger = slot.lock();
            // Released between lookup and lock: look it up again
            if ledger.released {
                continue;
            }
            return f(&mut ledger);
        }
    }

    fn next_handle(&self, bucket: &str) -> EntryHandle {
        EntryHandle {
            bucket: Arc::from(bucket),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn release_idle(&self, idle: Vec<String>) -> usize {
        if idle.is_empty() {
            return 0;
        }
        let mut released = 0;
        let mut buckets = self.buckets.write();
        for name in idle {
            let Some(slot) = buckets.get(&name).cloned() else {
                continue;
            };
            let mut ledger = slot.lock();
            if ledger.entries.is_empty() {
                ledger.released = true;
                buckets.remove(&name);
                released += 1;
            }
        }
        released
    }
}

impl InflightLedger for LocalLedger {
    fn reserve(&self, bucket: &str, delta_bytes: i64) -> EntryHandle {
        let handle = self.next_handle(bucket);
        let total = self.with_bucket(bucket, |ledger| {
            ledger.insert(handle.id, delta_bytes);
            ledger.total
        });
        debug!(bucket, id = handle.id, delta_bytes, pending_total = total, "Reserved");
        handle
    }

    fn reserve_within(
        &self,
        bucket: &str,
        delta_bytes: i64,
        headroom: i64,
    ) -> Result<EntryHandle, Overdraft> {
        let handle = self.next_handle(bucket);
        let total = self.with_bucket(bucket, |ledger| {
            if ledger.total.saturating_add(delta_bytes) > headroom {
                return Err(Overdraft {
                    pending_total: ledger.total,
                });
            }
            ledger.insert(handle.id, delta_bytes);
            Ok(ledger.total)
        })?;
        debug!(bucket, id = handle.id, delta_bytes, headroom, pending_total = total, "Reserved");
        Ok(handle)
    }

    fn commit(&self, handle: &EntryHandle) -> QuotaResult<()> {
        let unknown = || {
            QuotaError::LedgerInconsistency(format!(
                "commit of unknown entry {} on bucket {}",
                handle.id, handle.bucket
            ))
        };
        let slot = self.existing(handle.bucket()).ok_or_else(unknown)?;
        let mut ledger = slot.lock();
        let entry = ledger.entries.get_mut(&handle.id).ok_or_else(unknown)?;
        match entry.state {
            EntryState::Pending => {
                entry.state = EntryState::Committed { at: Instant::now() };
                Ok(())
            }
            EntryState::Committed { .. } => Err(QuotaError::LedgerInconsistency(format!(
                "entry {} on bucket {} committed twice",
                handle.id, handle.bucket
            ))),
        }
    }

    fn rollback(&self, handle: &EntryHandle) -> QuotaResult<()> {
        let unknown = || {
            QuotaError::LedgerInconsistency(format!(
                "rollback of unknown entry {} on bucket {}",
                handle.id, handle.bucket
            ))
        };
        let slot = self.existing(handle.bucket()).ok_or_else(unknown)?;
        let mut ledger = slot.lock();
        let entry = ledger.entries.remove(&handle.id).ok_or_else(unknown)?;
        ledger.total -= entry.delta_bytes;
        debug!(
            bucket = handle.bucket(),
            id = handle.id,
            delta_bytes = entry.delta_bytes,
            pending_total = ledger.total,
            "Rolled back"
        );
        Ok(())
    }

    fn pending_total(&self, bucket: &str) -> i64 {
        self.existing(bucket)
            .map(|slot| slot.lock().total)
            .unwrap_or(0)
    }

    fn flush(&self) -> FlushStats {
        let now = Instant::now();
        let window = self.reconciliation_window;
        let max_pending_age = self.max_pending_age;
        let mut stats = FlushStats::default();
        let mut idle = Vec::new();

        let slots: Vec<(String, Arc<Mutex<BucketLedger>>)> = self
            .buckets
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();

        for (name, slot) in slots {
            let mut guard = slot.lock();
            let BucketLedger { entries, total, .. } = &mut *guard;

            entries.retain(|id, entry| {
                let discard = match entry.state {
                    EntryState::Committed { at } => {
                        let done = now.saturating_duration_since(at) >= window;
                        if done {
                            stats.flushed += 1;
                        }
                        done
                    }
                    EntryState::Pending => {
                        let leaked = max_pending_age.is_some_and(|max| {
                            now.saturating_duration_since(entry.created_at) >= max
                        });
                        if leaked {
                            warn!(
                                bucket = %name,
                                id,
                                delta_bytes = entry.delta_bytes,
                                "Ledger inconsistency: reservation never resolved, forcing rollback"
                            );
                            stats.expired += 1;
                        }
                        leaked
                    }
                };
                if discard {
                    *total -= entry.delta_bytes;
                }
                !discard
            });

            if entries.is_empty() {
                idle.push(name);
            }
        }

        stats.buckets_released = self.release_idle(idle);
        if stats.flushed > 0 || stats.expired > 0 {
            debug!(
                flushed = stats.flushed,
                expired = stats.expired,
                released = stats.buckets_released,
                "Ledger flushed"
            );
        }
        stats
    }
}
