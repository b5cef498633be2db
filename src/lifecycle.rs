//! The per-collection lifecycle scheduler: a single background thread
//! running the TTL-cleanup and index-maintenance jobs, collapsed into the
//! same tick loop since both are cheap periodic sweeps over the same
//! collection state.
//!
//! A control channel feeds a dedicated `thread::spawn`, with `Drop`
//! dropping the sender and joining the handle. The background thread
//! processes `Tick`/`Shutdown` messages on an `mpsc` channel; there is no
//! reply value, since the scheduler's job is side effects (expiry,
//! rebuild, persist) observed later through the collection's own state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::LifecycleConfig;
use crate::error::Result;
use crate::id::Clock;
use crate::index::Index;
use crate::persistence::PersistentIndex;
use crate::store::Store;

/// Aggregated "has errors" signal for background-task failures: logged,
/// never propagated, but kept observable somewhere.
#[derive(Debug, Default, Clone)]
pub struct LifecycleHealth {
    pub last_ttl_error: Option<String>,
    pub last_maintenance_error: Option<String>,
}

enum Msg {
    Shutdown,
}

/// One named, registered index plus its persistence handle (`None` for a
/// volatile collection).
pub struct ManagedIndex {
    pub index: Arc<dyn Index>,
    pub persistent: Option<Arc<PersistentIndex>>,
}

/// Callbacks the scheduler needs from the owning collection. Kept as a
/// trait so `lifecycle` does not depend on `collection`'s concrete type —
/// the declared leaf order is Schema → Store → IndexEngine → Collection →
/// LifecycleScheduler, so the scheduler must not depend upward on
/// `Collection`. Rebuild's registry swap is delegated back to the
/// collection via `rebuild_index` rather than performed here, since only
/// the collection owns the index registry lock.
pub trait LifecycleTarget: Send + Sync {
    fn store(&self) -> &dyn Store;

    /// A point-in-time snapshot of `(index_name, handle)` pairs. Reference
    /// counting means a handle taken here stays valid even if the
    /// collection swaps in a rebuilt index moments later.
    fn snapshot_indexes(&self) -> Vec<(String, Arc<ManagedIndex>)>;

    /// Perform the rebuild-and-swap for the named index; a no-op if the
    /// index no longer exists.
    fn rebuild_index(&self, name: &str) -> Result<()>;

    fn clock(&self) -> &dyn Clock;
}

/// Background scheduler for one collection. Owns a single worker thread
/// processing tick/shutdown messages; `Drop` cancels and joins it.
pub struct Lifecycle {
    tx: mpsc::Sender<Msg>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    health: Arc<RwLock<LifecycleHealth>>,
    running: Arc<AtomicBool>,
}

impl Lifecycle {
    pub fn start<T>(target: Arc<T>, config: LifecycleConfig) -> Self
    where
        T: LifecycleTarget + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let health = Arc::new(RwLock::new(LifecycleHealth::default()));
        let running = Arc::new(AtomicBool::new(true));

        let worker_health = health.clone();
        let worker_running = running.clone();
        let handle = thread::spawn(move || run(target, config, rx, worker_health, worker_running));

        Lifecycle {
            tx,
            handle: Mutex::new(Some(handle)),
            health,
            running,
        }
    }

    pub fn health(&self) -> LifecycleHealth {
        self.health.read().expect("lifecycle health lock poisoned").clone()
    }

    /// Cancel both jobs, join the worker thread. Idempotent: a second call
    /// after the thread has already stopped is a no-op.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(handle) = self.handle.lock().expect("lifecycle handle lock poisoned").take() {
            if handle.join().is_err() {
                error!("lifecycle worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T: LifecycleTarget + 'static>(
    target: Arc<T>,
    config: LifecycleConfig,
    rx: mpsc::Receiver<Msg>,
    health: Arc<RwLock<LifecycleHealth>>,
    running: Arc<AtomicBool>,
) {
    let step = Duration::from_secs(config.ttl_cleanup_seconds.min(config.index_maintenance_seconds).max(1));
    let mut since_ttl = Duration::ZERO;
    let mut since_maintenance = Duration::ZERO;

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(step) {
            Ok(Msg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }

        since_ttl += step;
        since_maintenance += step;

        if since_ttl >= Duration::from_secs(config.ttl_cleanup_seconds) {
            since_ttl = Duration::ZERO;
            if let Err(e) = run_ttl_cleanup(target.as_ref()) {
                warn!(error = %e, "ttl cleanup tick failed, continuing at next interval");
                health.write().expect("lifecycle health lock poisoned").last_ttl_error = Some(e.to_string());
            }
        }

        if since_maintenance >= Duration::from_secs(config.index_maintenance_seconds) {
            since_maintenance = Duration::ZERO;
            if let Err(e) = run_index_maintenance(target.as_ref()) {
                warn!(error = %e, "index maintenance tick failed, continuing at next interval");
                health
                    .write()
                    .expect("lifecycle health lock poisoned")
                    .last_maintenance_error = Some(e.to_string());
            }
        }
    }
    flush_persist(target.as_ref());
}

fn run_ttl_cleanup<T: LifecycleTarget>(target: &T) -> Result<()> {
    let now_ns = target.clock().now_ns();
    let deltas = target.store().expire(now_ns)?;
    if deltas.is_empty() {
        return Ok(());
    }
    for (_, managed) in target.snapshot_indexes() {
        managed.index.apply(&deltas)?;
    }
    Ok(())
}

fn run_index_maintenance<T: LifecycleTarget>(target: &T) -> Result<()> {
    let now_ns = target.clock().now_ns();
    for (name, managed) in target.snapshot_indexes() {
        if managed.index.need_rebuild() {
            target.rebuild_index(&name)?;
            continue;
        }
        if let Some(persistent) = &managed.persistent {
            persistent.persist(managed.index.as_ref(), now_ns)?;
        }
    }
    Ok(())
}

fn flush_persist<T: LifecycleTarget>(target: &T) {
    let now_ns = target.clock().now_ns();
    for (_, managed) in target.snapshot_indexes() {
        if let Some(persistent) = &managed.persistent {
            if let Err(e) = persistent.persist(managed.index.as_ref(), now_ns) {
                warn!(error = %e, "flush-persist on shutdown failed");
            }
        }
    }
}
