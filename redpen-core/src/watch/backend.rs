//! Native watcher backend built on `notify`.
//!
//! The backend only translates raw `notify` events into [`RawEvent`]s and
//! pushes them into the registry's sink; filtering and debouncing happen in
//! the registry so every backend gets the same treatment.

use std::path::{Path, PathBuf};

use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{trace, warn};

use crate::error::WatchError;
use crate::types::ChangeKind;

/// An undebounced change reported by a backend, with an absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Where a backend delivers raw events. Sending never blocks, so it is safe
/// to call from a backend's own notification thread.
pub type RawSink = UnboundedSender<RawEvent>;

/// Starts native directory watchers.
pub trait WatchBackend: Send + Sync + 'static {
    /// Begins watching `root` recursively, delivering raw events to `sink`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Start`] if the native watcher cannot be created.
    fn start(&self, root: &Path, sink: RawSink) -> Result<Box<dyn WatchHandle>, WatchError>;
}

/// A running native watcher. Dropping it also stops the watch.
pub trait WatchHandle: Send {
    /// Stops the watch.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Close`] if the native watcher refuses to stop.
    fn close(self: Box<Self>) -> Result<(), WatchError>;
}

/// Production backend: the platform's recommended `notify` watcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyBackend;

impl WatchBackend for NotifyBackend {
    fn start(&self, root: &Path, sink: RawSink) -> Result<Box<dyn WatchHandle>, WatchError> {
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for raw in translate(&event) {
                    trace!(?raw, "raw filesystem event");
                    // The registry side closes first on teardown.
                    let _ = sink.send(raw);
                }
            }
            Err(err) => warn!(%err, "filesystem watcher reported an error"),
        })
        .map_err(|source| WatchError::Start { root: root.to_path_buf(), source })?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Start { root: root.to_path_buf(), source })?;

        Ok(Box::new(NotifyHandle { root: root.to_path_buf(), watcher }))
    }
}

struct NotifyHandle {
    root: PathBuf,
    watcher: RecommendedWatcher,
}

impl WatchHandle for NotifyHandle {
    fn close(mut self: Box<Self>) -> Result<(), WatchError> {
        let root = self.root.clone();
        self.watcher
            .unwatch(&root)
            .map_err(|source| WatchError::Close { root, source })
    }
}

/// Maps one `notify` event onto zero or more raw change events.
pub fn translate(event: &Event) -> Vec<RawEvent> {
    let raw = |kind: ChangeKind, path: &PathBuf| RawEvent { kind, path: path.clone() };
    let added = |path: &PathBuf| {
        if path.is_dir() {
            raw(ChangeKind::AddDir, path)
        } else {
            raw(ChangeKind::Add, path)
        }
    };

    match &event.kind {
        EventKind::Create(CreateKind::Folder) => {
            event.paths.iter().map(|p| raw(ChangeKind::AddDir, p)).collect()
        }
        EventKind::Create(CreateKind::File) => {
            event.paths.iter().map(|p| raw(ChangeKind::Add, p)).collect()
        }
        EventKind::Create(_) => event.paths.iter().map(added).collect(),

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().map(|p| raw(ChangeKind::Unlink, p)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.iter().map(added).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut out = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                out.push(raw(ChangeKind::Unlink, from));
            }
            if let Some(to) = event.paths.get(1) {
                out.push(added(to));
            }
            out
        }
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| if p.exists() { added(p) } else { raw(ChangeKind::Unlink, p) })
            .collect(),
        // Directory mtime churn is not interesting to the client.
        EventKind::Modify(_) => event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| raw(ChangeKind::Change, p))
            .collect(),

        EventKind::Remove(RemoveKind::Folder) => {
            event.paths.iter().map(|p| raw(ChangeKind::UnlinkDir, p)).collect()
        }
        EventKind::Remove(_) => event.paths.iter().map(|p| raw(ChangeKind::Unlink, p)).collect(),

        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut e = Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    #[test]
    fn maps_basic_kinds() {
        let created = translate(&event(EventKind::Create(CreateKind::File), &["/r/a.ts"]));
        assert_eq!(created[0].kind, ChangeKind::Add);

        let modified = translate(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/r/a.ts"],
        ));
        assert_eq!(modified[0].kind, ChangeKind::Change);

        let removed_dir = translate(&event(EventKind::Remove(RemoveKind::Folder), &["/r/d"]));
        assert_eq!(removed_dir[0].kind, ChangeKind::UnlinkDir);

        let removed = translate(&event(EventKind::Remove(RemoveKind::Any), &["/r/a.ts"]));
        assert_eq!(removed[0].kind, ChangeKind::Unlink);
    }

    #[test]
    fn rename_both_splits_into_unlink_and_add() {
        let out = translate(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/nowhere/old.ts", "/nowhere/new.ts"],
        ));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, ChangeKind::Unlink);
        assert_eq!(out[1].kind, ChangeKind::Add);
        assert_eq!(out[1].path, PathBuf::from("/nowhere/new.ts"));
    }

    #[test]
    fn access_is_ignored() {
        assert!(translate(&event(EventKind::Access(AccessKind::Any), &["/r/a.ts"])).is_empty());
    }
}
