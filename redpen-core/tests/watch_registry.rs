//! Integration tests for the shared watcher: reference counting, debounce
//! coalescing, noise filtering, and teardown. A scripted backend stands in for
//! `notify` so raw events can be injected at exact (paused) times.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redpen_core::watch::{RawEvent, RawSink, WatchBackend, WatchHandle};
use redpen_core::{ChangeEvent, ChangeKind, WatchConfig, WatchError, WatchRegistry};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct Script {
    starts: usize,
    closes: usize,
    fail_start: bool,
    fail_close: bool,
    sinks: HashMap<PathBuf, RawSink>,
}

#[derive(Clone, Default)]
struct ScriptedBackend {
    script: Arc<Mutex<Script>>,
}

impl ScriptedBackend {
    fn starts(&self) -> usize {
        self.script.lock().unwrap().starts
    }

    fn closes(&self) -> usize {
        self.script.lock().unwrap().closes
    }

    fn failing(start: bool, close: bool) -> Self {
        let backend = Self::default();
        {
            let mut script = backend.script.lock().unwrap();
            script.fail_start = start;
            script.fail_close = close;
        }
        backend
    }

    fn emit(&self, root: &Path, kind: ChangeKind, rel: &str) {
        let script = self.script.lock().unwrap();
        let sink = script.sinks.get(root).expect("root is watched");
        sink.send(RawEvent { kind, path: root.join(rel) }).unwrap();
    }
}

struct ScriptedHandle {
    script: Arc<Mutex<Script>>,
    root: PathBuf,
}

impl WatchBackend for ScriptedBackend {
    fn start(&self, root: &Path, sink: RawSink) -> Result<Box<dyn WatchHandle>, WatchError> {
        let mut script = self.script.lock().unwrap();
        if script.fail_start {
            return Err(WatchError::Start {
                root: root.to_path_buf(),
                source: notify::Error::generic("no inotify watches left"),
            });
        }
        script.starts += 1;
        script.sinks.insert(root.to_path_buf(), sink);
        Ok(Box::new(ScriptedHandle { script: Arc::clone(&self.script), root: root.to_path_buf() }))
    }
}

impl WatchHandle for ScriptedHandle {
    fn close(self: Box<Self>) -> Result<(), WatchError> {
        let mut script = self.script.lock().unwrap();
        script.closes += 1;
        script.sinks.remove(&self.root);
        if script.fail_close {
            return Err(WatchError::Close {
                root: self.root.clone(),
                source: notify::Error::generic("watch descriptor already gone"),
            });
        }
        Ok(())
    }
}

fn registry() -> (WatchRegistry, ScriptedBackend) {
    let backend = ScriptedBackend::default();
    (WatchRegistry::with_backend(WatchConfig::default(), backend.clone()), backend)
}

fn collector() -> (impl Fn(ChangeEvent) + Send + Sync + 'static, mpsc::UnboundedReceiver<(ChangeEvent, Instant)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |event: ChangeEvent| {
        let _ = tx.send((event, Instant::now()));
    }, rx)
}

#[tokio::test(start_paused = true)]
async fn one_watcher_per_root_closed_by_last_unsubscribe() {
    let dir = tempfile::TempDir::new().unwrap();
    let (registry, backend) = registry();

    let first = registry.subscribe(dir.path(), |_| {}).unwrap();
    let second = registry.subscribe(dir.path().join("."), |_| {}).unwrap();
    assert_eq!(backend.starts(), 1);
    assert_eq!(registry.watcher_count(), 1);
    assert_eq!(registry.subscriber_count(dir.path()), 2);

    first.unsubscribe();
    assert_eq!(backend.closes(), 0);
    assert_eq!(registry.subscriber_count(dir.path()), 1);

    drop(second);
    assert_eq!(backend.closes(), 1);
    assert_eq!(registry.watcher_count(), 0);

    // A fresh subscriber starts a fresh watcher.
    let _third = registry.subscribe(dir.path(), |_| {}).unwrap();
    assert_eq!(backend.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn rapid_writes_settle_into_one_event_after_the_last() {
    let dir = tempfile::TempDir::new().unwrap();
    let (registry, backend) = registry();
    let (callback, mut rx) = collector();
    let sub = registry.subscribe(dir.path(), callback).unwrap();
    let root = sub.root().to_path_buf();

    for _ in 0..5 {
        backend.emit(&root, ChangeKind::Change, "x.ts");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let last_write = Instant::now() - Duration::from_millis(50);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err(), "fired before the window elapsed");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (event, at) = rx.try_recv().expect("one settled event");
    assert_eq!(event, ChangeEvent { kind: ChangeKind::Change, path: "x.ts".to_owned() });
    assert!(at >= last_write + Duration::from_millis(300));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rx.try_recv().is_err(), "more than one event delivered");
}

#[tokio::test(start_paused = true)]
async fn subscribers_share_one_timer_per_path() {
    let dir = tempfile::TempDir::new().unwrap();
    let (registry, backend) = registry();
    let (cb_a, mut rx_a) = collector();
    let (cb_b, mut rx_b) = collector();
    let sub_a = registry.subscribe(dir.path(), cb_a).unwrap();
    let _sub_b = registry.subscribe(dir.path(), cb_b).unwrap();
    let root = sub_a.root().to_path_buf();

    backend.emit(&root, ChangeKind::Add, "src/new.ts");
    backend.emit(&root, ChangeKind::Change, "src/new.ts");
    backend.emit(&root, ChangeKind::Change, "other.ts");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(registry.pending_count(&root), 2);

    tokio::time::sleep(Duration::from_millis(400)).await;
    for rx in [&mut rx_a, &mut rx_b] {
        let mut paths = vec![rx.try_recv().unwrap().0.path, rx.try_recv().unwrap().0.path];
        paths.sort();
        assert_eq!(paths, vec!["other.ts".to_owned(), "src/new.ts".to_owned()]);
        assert!(rx.try_recv().is_err());
    }
    assert_eq!(registry.pending_count(&root), 0);
}

#[tokio::test(start_paused = true)]
async fn last_raw_kind_wins() {
    let dir = tempfile::TempDir::new().unwrap();
    let (registry, backend) = registry();
    let (callback, mut rx) = collector();
    let sub = registry.subscribe(dir.path(), callback).unwrap();
    let root = sub.root().to_path_buf();

    backend.emit(&root, ChangeKind::Change, "gone.ts");
    backend.emit(&root, ChangeKind::Unlink, "gone.ts");
    tokio::time::sleep(Duration::from_millis(350)).await;

    assert_eq!(rx.try_recv().unwrap().0.kind, ChangeKind::Unlink);
}

#[tokio::test(start_paused = true)]
async fn noise_directories_are_dropped() {
    let dir = tempfile::TempDir::new().unwrap();
    let (registry, backend) = registry();
    let (callback, mut rx) = collector();
    let sub = registry.subscribe(dir.path(), callback).unwrap();
    let root = sub.root().to_path_buf();

    backend.emit(&root, ChangeKind::Change, ".git/index");
    backend.emit(&root, ChangeKind::Add, "web/node_modules/pkg/index.js");
    backend.emit(&root, ChangeKind::Change, "dist/bundle.js");
    backend.emit(&root, ChangeKind::Change, "src/distance.ts");
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(rx.try_recv().unwrap().0.path, "src/distance.ts");
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_cancels_pending_timers() {
    let dir = tempfile::TempDir::new().unwrap();
    let (registry, backend) = registry();
    let (callback, mut rx) = collector();
    let sub = registry.subscribe(dir.path(), callback).unwrap();
    let root = sub.root().to_path_buf();

    backend.emit(&root, ChangeKind::Change, "x.ts");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.pending_count(&root), 1);

    sub.unsubscribe();
    assert_eq!(registry.pending_count(&root), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn callback_may_unsubscribe_itself() {
    let dir = tempfile::TempDir::new().unwrap();
    let (registry, backend) = registry();
    let slot: Arc<Mutex<Option<redpen_core::Subscription>>> = Arc::default();
    let hits = Arc::new(Mutex::new(0usize));

    let sub = {
        let slot = Arc::clone(&slot);
        let hits = Arc::clone(&hits);
        registry
            .subscribe(dir.path(), move |_| {
                *hits.lock().unwrap() += 1;
                slot.lock().unwrap().take();
            })
            .unwrap()
    };
    let root = sub.root().to_path_buf();
    *slot.lock().unwrap() = Some(sub);

    backend.emit(&root, ChangeKind::Change, "x.ts");
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(*hits.lock().unwrap(), 1);
    assert_eq!(registry.watcher_count(), 0);
    assert_eq!(backend.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_peer_is_skipped_mid_dispatch() {
    let dir = tempfile::TempDir::new().unwrap();
    let (registry, backend) = registry();
    let peer: Arc<Mutex<Option<redpen_core::Subscription>>> = Arc::default();

    // Subscribed first, so called first; it tears down the second subscriber.
    let first = {
        let peer = Arc::clone(&peer);
        registry
            .subscribe(dir.path(), move |_| {
                if let Some(sub) = peer.lock().unwrap().take() {
                    sub.unsubscribe();
                }
            })
            .unwrap()
    };
    let (callback, mut rx) = collector();
    *peer.lock().unwrap() = Some(registry.subscribe(dir.path(), callback).unwrap());
    let root = first.root().to_path_buf();

    backend.emit(&root, ChangeKind::Change, "x.ts");
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(rx.try_recv().is_err(), "callback ran after unsubscribe");
    assert_eq!(registry.subscriber_count(&root), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_start_registers_nothing() {
    let dir = tempfile::TempDir::new().unwrap();
    let backend = ScriptedBackend::failing(true, false);
    let registry = WatchRegistry::with_backend(WatchConfig::default(), backend.clone());

    let err = registry.subscribe(dir.path(), |_| {}).unwrap_err();
    assert!(matches!(err, WatchError::Start { .. }));
    assert_eq!(registry.watcher_count(), 0);
    assert_eq!(registry.subscriber_count(dir.path()), 0);
    assert_eq!(backend.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_close_still_tears_down() {
    let dir = tempfile::TempDir::new().unwrap();
    let backend = ScriptedBackend::failing(false, true);
    let registry = WatchRegistry::with_backend(WatchConfig::default(), backend.clone());
    let (callback, mut rx) = collector();
    let sub = registry.subscribe(dir.path(), callback).unwrap();
    let root = sub.root().to_path_buf();

    backend.emit(&root, ChangeKind::Change, "x.ts");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(registry.pending_count(&root), 1);

    sub.unsubscribe();
    assert_eq!(backend.closes(), 1);
    assert_eq!(registry.watcher_count(), 0);
    assert_eq!(registry.pending_count(&root), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(rx.try_recv().is_err());

    // The root can be watched again afterwards.
    let _again = registry.subscribe(dir.path(), |_| {}).unwrap();
    assert_eq!(registry.watcher_count(), 1);
}

#[tokio::test]
async fn native_backend_reports_file_writes() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = WatchRegistry::new(WatchConfig { debounce: Duration::from_millis(50), ..WatchConfig::default() });
    let (callback, mut rx) = collector();
    let _sub = registry.subscribe(dir.path(), callback).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();

    let (event, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within timeout")
        .unwrap();
    assert_eq!(event.path, "hello.txt");
}
