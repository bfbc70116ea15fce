//! Background persistence ticker, grounded on the teacher crate's
//! `SpldbSaverTask` (interval-based condition check + spawned save) and on
//! `redis-go`'s `server_cron` dirty-counter/interval gate. Re-threaded onto a
//! plain OS thread since this spec has no async runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::core::store::Store;

/// Tick interval and change threshold from §6: "persistence tick is every 30
/// seconds; the change threshold is 1".
pub const TICK_INTERVAL: Duration = Duration::from_secs(30);
pub const CHANGE_THRESHOLD: usize = 1;

/// Counts mutations since the last successful save, and gates concurrent
/// background saves. Shared between the event loop (which bumps the counter
/// on every `Set`/`HSet`/`Del`) and the background ticker thread.
pub struct PersistenceCounters {
    pub dirty_keys: AtomicUsize,
    pub is_saving: AtomicBool,
}

impl PersistenceCounters {
    pub fn new() -> Self {
        PersistenceCounters {
            dirty_keys: AtomicUsize::new(0),
            is_saving: AtomicBool::new(false),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty_keys.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for PersistenceCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Performs one synchronous RDB save: snapshots the store, marshals it, and
/// writes it to `path` under an advisory lock. Used directly by `SAVE`
/// (foreground) and indirectly by `BGSAVE`/the ticker (on a worker thread).
pub fn save_now(store: &Store, path: &std::path::Path) -> Result<(), crate::core::errors::RedwireError> {
    let (values, expiry) = store.snapshot();
    let entries: Vec<_> = values
        .into_iter()
        .map(|(k, v)| {
            let deadline = expiry.get(&k).copied();
            (k, v, deadline)
        })
        .collect();
    let bytes = super::rdb::marshal(&entries);
    super::rdb::write_file(path, &bytes)
        .map_err(|e| crate::core::errors::RedwireError::Persistence(format!("RDB write failed: {e}")))
}

/// Loads `path` into `store` at startup. Per §7, an RDB load failure fails
/// startup; a missing file is not a failure (there's simply nothing to load).
pub fn load_into(store: &Store, path: &std::path::Path) -> Result<(), crate::core::errors::RedwireError> {
    if !path.exists() {
        return Ok(());
    }
    let bytes = super::rdb::read_file(path)
        .map_err(|e| crate::core::errors::RedwireError::Persistence(format!("RDB read failed: {e}")))?;
    let entries = super::rdb::unmarshal(&bytes)?;
    let mut values = HashMap::new();
    let mut expiry = HashMap::new();
    for (key, value, deadline) in entries {
        if let Some(d) = deadline {
            expiry.insert(key.clone(), d);
        }
        values.insert(key, value);
    }
    store.load(values, expiry);
    Ok(())
}

/// Spawns the background auto-save ticker thread. Returns its `JoinHandle` so
/// callers can decide whether to detach or join it (the event loop detaches
/// it — it runs for the lifetime of the process).
pub fn spawn_ticker(
    store: Arc<Store>,
    path: PathBuf,
    counters: Arc<PersistenceCounters>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        std::thread::sleep(TICK_INTERVAL);

        let dirty = counters.dirty_keys.load(Ordering::Relaxed);
        if dirty < CHANGE_THRESHOLD {
            continue;
        }
        if counters
            .is_saving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("background save already in progress, skipping this tick");
            continue;
        }

        let start = Instant::now();
        match save_now(&store, &path) {
            Ok(()) => {
                // Reset to zero on success: the source leaves the counter
                // running forever, which this spec's §9 calls out as the
                // wrong behavior to copy.
                counters.dirty_keys.store(0, Ordering::Relaxed);
                info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    dirty_keys = dirty,
                    "background RDB save completed"
                );
            }
            Err(e) => error!("background RDB save failed: {e}"),
        }
        counters.is_saving.store(false, Ordering::SeqCst);
    })
}
