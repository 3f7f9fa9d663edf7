//! Shared, debounced filesystem watching.
//!
//! [`WatchRegistry`] runs at most one native watcher per canonical root and
//! fans settled change events out to any number of subscribers. Raw events
//! are coalesced per `(root, relative path)`: every new raw event for a path
//! restarts that path's debounce timer, and only a timer that runs out
//! dispatches, once, to every current subscriber of the root.
//!
//! The registry is plain shared state behind a `std::sync::Mutex`; the lock
//! is never held across an `.await` or while subscriber callbacks run, so a
//! callback may itself unsubscribe. Once `unsubscribe` returns, no new call to
//! that subscriber's callback begins.

mod backend;

pub use backend::{translate, NotifyBackend, RawEvent, RawSink, WatchBackend, WatchHandle};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::paths;
use crate::types::ChangeEvent;

/// Quiet period after which a burst of raw events for one path settles.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Directory names whose contents never produce change events.
pub const DEFAULT_SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    ".next",
    "__pycache__",
    ".venv",
    "venv",
    ".cache",
    "dist",
    "build",
    ".turbo",
];

/// Subscriber callback. Runs on a tokio worker, outside the registry lock.
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub debounce: Duration,
    pub skip_dirs: BTreeSet<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            skip_dirs: DEFAULT_SKIP_DIRS.iter().map(|d| (*d).to_owned()).collect(),
        }
    }
}

/// Reference-counted registry of native watchers, one per canonical root.
///
/// Cheap to clone; clones share the same watchers.
#[derive(Clone)]
pub struct WatchRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    config: WatchConfig,
    backend: Box<dyn WatchBackend>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    roots: HashMap<PathBuf, RootEntry>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct RootEntry {
    /// Distinguishes this entry from an earlier one for the same root.
    generation: u64,
    handle: Option<Box<dyn WatchHandle>>,
    subscribers: BTreeMap<u64, Arc<Subscriber>>,
    pending: HashMap<String, PendingTimer>,
    pump: JoinHandle<()>,
}

struct Subscriber {
    callback: ChangeCallback,
    /// Cleared under the registry lock on unsubscribe; checked before each call.
    live: AtomicBool,
}

struct PendingTimer {
    seq: u64,
    task: JoinHandle<()>,
}

impl WatchRegistry {
    /// Creates a registry backed by the platform's native watcher.
    pub fn new(config: WatchConfig) -> Self {
        Self::with_backend(config, NotifyBackend)
    }

    pub fn with_backend(config: WatchConfig, backend: impl WatchBackend) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                backend: Box::new(backend),
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    /// Registers `callback` for settled changes under `root`.
    ///
    /// Starts a native watcher if this is the first subscriber for the
    /// canonical form of `root`. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Start`] if a new native watcher cannot be started;
    /// nothing is registered in that case.
    pub fn subscribe<F>(&self, root: impl AsRef<Path>, callback: F) -> Result<Subscription, WatchError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let root = paths::canonical_root(root.as_ref());
        let mut state = self.inner.lock();

        if !state.roots.contains_key(&root) {
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = self.inner.backend.start(&root, tx)?;
            let generation = state.next_id();
            let pump = tokio::spawn(pump(Arc::downgrade(&self.inner), root.clone(), generation, rx));
            state.roots.insert(
                root.clone(),
                RootEntry {
                    generation,
                    handle: Some(handle),
                    subscribers: BTreeMap::new(),
                    pending: HashMap::new(),
                    pump,
                },
            );
            info!(root = %root.display(), "watcher started");
        }

        let id = state.next_id();
        if let Some(entry) = state.roots.get_mut(&root) {
            let subscriber = Subscriber { callback: Arc::new(callback), live: AtomicBool::new(true) };
            entry.subscribers.insert(id, Arc::new(subscriber));
            debug!(root = %root.display(), subscribers = entry.subscribers.len(), "subscribed");
        }

        Ok(Subscription {
            registry: Arc::downgrade(&self.inner),
            root,
            id,
            released: false,
        })
    }

    /// Number of running native watchers.
    pub fn watcher_count(&self) -> usize {
        self.inner.lock().roots.len()
    }

    /// Number of subscribers on `root` (zero when it is not watched).
    pub fn subscriber_count(&self, root: impl AsRef<Path>) -> usize {
        let root = paths::canonical_root(root.as_ref());
        self.inner
            .lock()
            .roots
            .get(&root)
            .map_or(0, |entry| entry.subscribers.len())
    }

    /// Number of debounce timers currently waiting under `root`.
    pub fn pending_count(&self, root: impl AsRef<Path>) -> usize {
        let root = paths::canonical_root(root.as_ref());
        self.inner
            .lock()
            .roots
            .get(&root)
            .map_or(0, |entry| entry.pending.len())
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_skipped(&self, relative: &Path) -> bool {
        relative.components().any(|c| match c {
            Component::Normal(name) => self.config.skip_dirs.contains(&*name.to_string_lossy()),
            _ => false,
        })
    }

    /// Restarts the debounce timer for one raw event.
    fn ingest(self: &Arc<Self>, root: &Path, generation: u64, raw: RawEvent) {
        let Ok(relative) = raw.path.strip_prefix(root) else {
            return;
        };
        if relative.as_os_str().is_empty() || self.is_skipped(relative) {
            return;
        }
        let Some(rel) = paths::relative_display(root, &raw.path) else {
            return;
        };

        let mut state = self.lock();
        let seq = state.next_id();
        let Some(entry) = state.roots.get_mut(root) else {
            return;
        };
        if entry.generation != generation {
            return;
        }

        let weak = Arc::downgrade(self);
        let debounce = self.config.debounce;
        let root_owned = root.to_path_buf();
        let rel_owned = rel.clone();
        let kind = raw.kind;
        let task = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(&root_owned, &rel_owned, seq, ChangeEvent { kind, path: rel_owned.clone() });
            }
        });

        if let Some(previous) = entry.pending.insert(rel, PendingTimer { seq, task }) {
            previous.task.abort();
        }
    }

    /// Dispatches a settled event if its timer is still the current one.
    fn fire(&self, root: &Path, rel: &str, seq: u64, event: ChangeEvent) {
        let subscribers: Vec<Arc<Subscriber>> = {
            let mut state = self.lock();
            let Some(entry) = state.roots.get_mut(root) else {
                return;
            };
            match entry.pending.get(rel) {
                Some(timer) if timer.seq == seq => {
                    entry.pending.remove(rel);
                }
                _ => return,
            }
            entry.subscribers.values().cloned().collect()
        };

        debug!(root = %root.display(), path = %event.path, kind = ?event.kind, "change settled");
        for subscriber in subscribers {
            // An earlier callback in this batch may have unsubscribed it.
            if subscriber.live.load(Ordering::Acquire) {
                (subscriber.callback)(event.clone());
            }
        }
    }

    fn unsubscribe(&self, root: &Path, id: u64) {
        let handle = {
            let mut state = self.lock();
            let Some(entry) = state.roots.get_mut(root) else {
                return;
            };
            if let Some(subscriber) = entry.subscribers.remove(&id) {
                subscriber.live.store(false, Ordering::Release);
            }
            if !entry.subscribers.is_empty() {
                debug!(root = %root.display(), subscribers = entry.subscribers.len(), "unsubscribed");
                return;
            }
            let Some(mut entry) = state.roots.remove(root) else {
                return;
            };
            for (_, timer) in entry.pending.drain() {
                timer.task.abort();
            }
            entry.pump.abort();
            entry.handle.take()
        };

        if let Some(handle) = handle {
            if let Err(err) = handle.close() {
                warn!(%err, "failed to close watcher");
            }
        }
        info!(root = %root.display(), "watcher stopped");
    }
}

/// Moves raw events from a backend into the debouncer until the backend
/// goes away or the root is torn down.
async fn pump(
    inner: Weak<Inner>,
    root: PathBuf,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<RawEvent>,
) {
    while let Some(raw) = rx.recv().await {
        let Some(registry) = inner.upgrade() else {
            break;
        };
        registry.ingest(&root, generation, raw);
    }
}

/// A live registration. Unsubscribes on [`Subscription::unsubscribe`] or drop,
/// whichever comes first; the second is a no-op.
pub struct Subscription {
    registry: Weak<Inner>,
    root: PathBuf,
    id: u64,
    released: bool,
}

impl Subscription {
    /// Canonical root this subscription watches.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            inner.unsubscribe(&self.root, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("root", &self.root)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}
