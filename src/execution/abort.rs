//! Abort controller - pipeline-wide cancellation and termination of external processes
//!
//! One controller is created per pipeline run. Stage attempts get a `child()`
//! controller: aborting the parent aborts every child, aborting a child (for
//! example on a stage timeout) leaves the parent untouched.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Time a process gets to exit after the graceful signal
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Signal sent to a registered process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// Ask the process to shut down (SIGTERM)
    Graceful,
    /// Kill the process (SIGKILL)
    Forced,
}

/// An external process the controller may terminate.
///
/// Implemented by whoever spawns the process; the controller only needs to
/// signal it and learn when it is gone.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if known
    fn pid(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    fn signal(&self, signal: TerminationSignal) -> std::io::Result<()>;

    /// Resolves once the process has exited
    async fn exited(&self);
}

/// Returned by `throw_if_aborted` once the pipeline is cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Pipeline was aborted")]
pub struct Aborted;

/// Identifier handed out by `register_process`
pub type ProcessId = u64;

type AbortListener = Box<dyn FnOnce() + Send>;

/// A registered process, shared between a controller and its ancestors
struct Registration {
    handle: Arc<dyn ProcessHandle>,
    terminating: AtomicBool,
}

struct Inner {
    aborted: AtomicBool,
    notify: watch::Sender<bool>,
    listeners: Mutex<Vec<AbortListener>>,
    children: Mutex<Vec<Weak<Inner>>>,
    processes: Mutex<HashMap<ProcessId, Arc<Registration>>>,
    next_id: Arc<AtomicU64>,
    grace_period: Duration,
    /// Controllers that also track processes registered here
    ancestors: Vec<Weak<Inner>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cancellation authority for one pipeline run
#[derive(Clone)]
pub struct AbortController {
    inner: Arc<Inner>,
}

impl AbortController {
    pub fn new() -> Self {
        Self::with_grace_period(DEFAULT_GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self::build(grace_period, Vec::new(), Arc::new(AtomicU64::new(0)))
    }

    fn build(grace_period: Duration, ancestors: Vec<Weak<Inner>>, next_id: Arc<AtomicU64>) -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                aborted: AtomicBool::new(false),
                notify,
                listeners: Mutex::new(Vec::new()),
                children: Mutex::new(Vec::new()),
                processes: Mutex::new(HashMap::new()),
                next_id,
                grace_period,
                ancestors,
            }),
        }
    }

    /// Create a scoped controller that is aborted together with this one
    pub fn child(&self) -> AbortController {
        let mut ancestors = self.inner.ancestors.clone();
        ancestors.push(Arc::downgrade(&self.inner));

        let child = Self::build(self.inner.grace_period, ancestors, self.inner.next_id.clone());

        let mut children = lock(&self.inner.children);
        if self.is_aborted() {
            drop(children);
            child.abort();
        } else {
            // Attempts come and go; forget the ones already dropped
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }

        child
    }

    /// Current flag value
    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Cooperative cancellation check
    pub fn throw_if_aborted(&self) -> Result<(), Aborted> {
        if self.is_aborted() {
            Err(Aborted)
        } else {
            Ok(())
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.inner.grace_period
    }

    /// Resolves once the controller has been aborted
    pub async fn cancelled(&self) {
        let mut rx = self.inner.notify.subscribe();
        // The sender lives as long as `self`, so this cannot fail early
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    /// Register a one-shot listener; runs immediately if already aborted
    pub fn on_abort<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        if self.is_aborted() {
            drop(listeners);
            run_listener(Box::new(listener));
        } else {
            listeners.push(Box::new(listener));
        }
    }

    /// Track an external process for this run.
    ///
    /// The process is dropped from the registry once it exits. A process
    /// registered after abort is terminated right away.
    pub fn register_process(&self, handle: Arc<dyn ProcessHandle>) -> ProcessId {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let registration = Arc::new(Registration {
            handle: handle.clone(),
            terminating: AtomicBool::new(false),
        });

        let mut owners = vec![self.inner.clone()];
        owners.extend(self.inner.ancestors.iter().filter_map(Weak::upgrade));
        for owner in &owners {
            lock(&owner.processes).insert(id, registration.clone());
        }
        debug!("Registered process {} (pid {:?})", id, handle.pid());

        if owners.iter().any(|owner| owner.aborted.load(Ordering::SeqCst)) {
            terminate(registration.clone(), self.inner.grace_period);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let owners: Vec<Weak<Inner>> = owners.iter().map(Arc::downgrade).collect();
                runtime.spawn(async move {
                    handle.exited().await;
                    for owner in owners.iter().filter_map(Weak::upgrade) {
                        lock(&owner.processes).remove(&id);
                    }
                    debug!("Process {} exited and was unregistered", id);
                });
            }
            Err(_) => warn!("No async runtime; process {} will not unregister on exit", id),
        }

        id
    }

    /// Stop tracking a process without signalling it
    pub fn unregister_process(&self, id: ProcessId) {
        lock(&self.inner.processes).remove(&id);
        for ancestor in self.inner.ancestors.iter().filter_map(Weak::upgrade) {
            lock(&ancestor.processes).remove(&id);
        }
    }

    /// Number of registered processes that are still running
    pub fn live_processes(&self) -> usize {
        lock(&self.inner.processes)
            .values()
            .filter(|r| r.handle.is_alive())
            .count()
    }

    /// Request cancellation. Only the first call has any effect.
    pub fn abort(&self) {
        if self
            .inner
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.inner.notify.send_replace(true);

        let listeners = std::mem::take(&mut *lock(&self.inner.listeners));
        for listener in listeners {
            run_listener(listener);
        }

        let children = std::mem::take(&mut *lock(&self.inner.children));
        for inner in children.iter().filter_map(Weak::upgrade) {
            AbortController { inner }.abort();
        }

        let registrations: Vec<Arc<Registration>> =
            lock(&self.inner.processes).values().cloned().collect();
        if !registrations.is_empty() {
            info!("Abort requested; terminating {} process(es)", registrations.len());
        }
        for registration in registrations {
            terminate(registration, self.inner.grace_period);
        }
    }

    /// Wait until every registered process has exited
    pub async fn wait_for_processes(&self) {
        let handles: Vec<Arc<dyn ProcessHandle>> = lock(&self.inner.processes)
            .values()
            .map(|r| r.handle.clone())
            .collect();
        for handle in handles {
            handle.exited().await;
        }
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AbortController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortController")
            .field("aborted", &self.is_aborted())
            .field("processes", &lock(&self.inner.processes).len())
            .field("grace_period", &self.inner.grace_period)
            .finish()
    }
}

fn run_listener(listener: AbortListener) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(listener)) {
        warn!("Abort listener panicked: {:?}", e);
    }
}

/// Graceful signal now, forced signal if still alive after the grace period
fn terminate(registration: Arc<Registration>, grace_period: Duration) {
    if registration.terminating.swap(true, Ordering::SeqCst) {
        return;
    }

    let handle = registration.handle.clone();
    if !handle.is_alive() {
        return;
    }

    if let Err(e) = handle.signal(TerminationSignal::Graceful) {
        warn!("Failed to signal process {:?}: {}", handle.pid(), e);
    }

    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                tokio::select! {
                    _ = handle.exited() => {
                        debug!("Process {:?} exited within grace period", handle.pid());
                    }
                    _ = tokio::time::sleep(grace_period) => {
                        if handle.is_alive() {
                            warn!(
                                "Process {:?} still alive after {:?}; forcing termination",
                                handle.pid(),
                                grace_period
                            );
                            if let Err(e) = handle.signal(TerminationSignal::Forced) {
                                warn!("Failed to kill process {:?}: {}", handle.pid(), e);
                            }
                        }
                    }
                }
            });
        }
        Err(_) => {
            warn!("No async runtime for grace timer; forcing termination of {:?}", handle.pid());
            if let Err(e) = handle.signal(TerminationSignal::Forced) {
                warn!("Failed to kill process {:?}: {}", handle.pid(), e);
            }
        }
    }
}
