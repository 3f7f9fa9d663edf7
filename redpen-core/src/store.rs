//! The annotation store: active and resolved feedback for one reviewed root,
//! persisted as YAML under `<root>/.redpen/`.
//!
//! Active holds at most one item per `(file, start line)` anchor. Every
//! mutation below keeps that true, along with disjointness of the active and
//! resolved collections.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, SubsecRound, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::paths;
use crate::schema::{self, ACTIVE_FILE, DATA_DIR, LEGACY_FILE, RESOLVED_FILE};
use crate::types::{FeedbackItem, FeedbackStatus, ItemKey};

/// Feedback collections for one reviewed root.
///
/// Every operation is a full read-merge-write cycle against the YAML files in
/// `<root>/.redpen/`; nothing is cached between calls. Writers inside this
/// process are serialized through one lock per store, so all callers for a
/// root must share the same instance (see [`StoreRegistry`]). Writers in other
/// processes are not coordinated with.
#[derive(Debug)]
pub struct FeedbackStore {
    root: PathBuf,
    dir: PathBuf,
    write_lock: Mutex<()>,
}

/// Collection contents keyed by identity; iteration order is the canonical order.
type Collection = BTreeMap<ItemKey, FeedbackItem>;

fn into_collection(items: Vec<FeedbackItem>) -> Collection {
    items.into_iter().map(|item| (item.key(), item)).collect()
}

/// Keys in `active` sharing `key`'s file and start line.
fn same_anchor(active: &Collection, key: &ItemKey) -> Vec<ItemKey> {
    active
        .keys()
        .filter(|k| k.file_path == key.file_path && k.line_number == key.line_number)
        .cloned()
        .collect()
}

/// Removes and returns every item holding `key`'s anchor.
fn take_anchor(active: &mut Collection, key: &ItemKey) -> Vec<FeedbackItem> {
    same_anchor(active, key)
        .into_iter()
        .filter_map(|old| active.remove(&old))
        .collect()
}

impl FeedbackStore {
    /// Binds a store to `root`. Does not touch the filesystem.
    pub fn open(root: impl AsRef<Path>) -> Self {
        let root = paths::canonical_root(root.as_ref());
        let dir = root.join(DATA_DIR);
        Self { root, dir, write_lock: Mutex::new(()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_FILE)
    }

    pub fn resolved_path(&self) -> PathBuf {
        self.dir.join(RESOLVED_FILE)
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.dir.join(LEGACY_FILE)
    }

    pub fn handoff_path(&self, id: &str) -> PathBuf {
        self.dir.join(schema::handoff_file_name(id))
    }

    /// Returns all draft and submitted items in canonical order.
    pub async fn list_active(&self) -> Vec<FeedbackItem> {
        let _guard = self.write_lock.lock().await;
        self.read_active().await.into_values().collect()
    }

    /// Returns all resolved items in canonical order.
    pub async fn list_resolved(&self) -> Vec<FeedbackItem> {
        let _guard = self.write_lock.lock().await;
        self.read_resolved().await.into_values().collect()
    }

    /// Merges one item into the active collection. See [`Self::upsert_many`].
    pub async fn upsert(&self, item: FeedbackItem) -> Result<Vec<FeedbackItem>, StoreError> {
        self.upsert_many(vec![item]).await
    }

    /// Merges items into the active collection by identity key.
    ///
    /// A later item replaces an earlier one with the same key, both within the
    /// batch and against what is on disk. An item also replaces any active item
    /// that starts on the same line of the same file, so widening `a.ts:10` to
    /// `a.ts:10-12` edits the comment in place. Overwriting a submitted item
    /// reopens it as a draft. An item whose key is currently resolved is taken out of
    /// the resolved collection so the two stay disjoint.
    ///
    /// Returns the active collection after the write.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] if any item is malformed (nothing is written),
    /// [`StoreError::Storage`] if a file cannot be written.
    pub async fn upsert_many(&self, items: Vec<FeedbackItem>) -> Result<Vec<FeedbackItem>, StoreError> {
        if items.is_empty() {
            return Err(StoreError::Validation("no feedback items given".to_owned()));
        }
        let items: Vec<FeedbackItem> = items.into_iter().map(FeedbackItem::normalized).collect();
        for item in &items {
            item.validate()?;
        }

        let _guard = self.write_lock.lock().await;
        let mut active = self.read_active().await;
        let mut resolved = self.read_resolved().await;
        let mut reopened = 0usize;

        for mut item in items {
            let key = item.key();
            // An item anchored at the same start line is the same comment with
            // a new extent.
            let previously_submitted = take_anchor(&mut active, &key)
                .iter()
                .any(|old| matches!(old.status, FeedbackStatus::Submitted { .. }));
            if previously_submitted || matches!(item.status, FeedbackStatus::Resolved { .. }) {
                item.status = FeedbackStatus::Draft;
            }
            if resolved.remove(&key).is_some() {
                reopened += 1;
            }
            active.insert(key, item);
        }

        self.write_collection(&self.active_path(), &active).await?;
        if reopened > 0 {
            self.write_collection(&self.resolved_path(), &resolved).await?;
            info!(root = %self.root.display(), reopened, "reopened resolved feedback");
        }
        debug!(root = %self.root.display(), active = active.len(), "feedback upserted");
        Ok(active.into_values().collect())
    }

    /// Replaces the whole active collection with `items`.
    ///
    /// Items are normalized and validated as in [`Self::upsert_many`]; a later
    /// item wins over an earlier one with the same key or start line. An empty
    /// list clears the collection. Keys that are currently resolved are taken
    /// out of the resolved collection.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] if any item is malformed;
    /// [`StoreError::Conflict`] if a submitted item would be dropped;
    /// [`StoreError::Storage`] if a file cannot be written.
    pub async fn replace_active(&self, items: Vec<FeedbackItem>) -> Result<Vec<FeedbackItem>, StoreError> {
        let items: Vec<FeedbackItem> = items.into_iter().map(FeedbackItem::normalized).collect();
        for item in &items {
            item.validate()?;
        }
        let mut next = Collection::new();
        for item in items {
            let key = item.key();
            take_anchor(&mut next, &key);
            next.insert(key, item);
        }

        let _guard = self.write_lock.lock().await;
        let current = self.read_active().await;
        if let Some(dropped) = current
            .iter()
            .find(|(key, item)| {
                matches!(item.status, FeedbackStatus::Submitted { .. }) && !next.contains_key(*key)
            })
        {
            return Err(StoreError::Conflict(format!(
                "{} was submitted to the agent; resolve it before removing",
                dropped.0
            )));
        }

        let mut resolved = self.read_resolved().await;
        let before = resolved.len();
        resolved.retain(|key, _| !next.contains_key(key));

        self.write_collection(&self.active_path(), &next).await?;
        if resolved.len() != before {
            self.write_collection(&self.resolved_path(), &resolved).await?;
        }
        info!(root = %self.root.display(), active = next.len(), "active feedback replaced");
        Ok(next.into_values().collect())
    }

    /// Moves one item from active to resolved. See [`Self::resolve_many`].
    pub async fn resolve(&self, key: &ItemKey) -> Result<FeedbackItem, StoreError> {
        let mut moved = self.resolve_many(std::slice::from_ref(key)).await?;
        moved.pop().ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    /// Moves items from active to resolved, stamping `resolved_at`.
    ///
    /// An item that already carries a resolution time keeps it. All keys are
    /// checked before anything is written.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for the first key missing from the active
    /// collection; [`StoreError::Storage`] if a file cannot be written.
    pub async fn resolve_many(&self, keys: &[ItemKey]) -> Result<Vec<FeedbackItem>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut active = self.read_active().await;
        if let Some(missing) = keys.iter().find(|key| !active.contains_key(key)) {
            return Err(StoreError::NotFound(missing.clone()));
        }

        let mut resolved = self.read_resolved().await;
        let now = now();
        let mut moved = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(mut item) = active.remove(key) else {
                continue;
            };
            let at = item.status.resolved_at().unwrap_or(now);
            item.status = FeedbackStatus::Resolved { at };
            resolved.insert(key.clone(), item.clone());
            moved.push(item);
        }

        // Resolved first: a failure between the two writes leaves the item
        // visible in both lists rather than lost.
        self.write_collection(&self.resolved_path(), &resolved).await?;
        self.write_collection(&self.active_path(), &active).await?;
        info!(root = %self.root.display(), count = moved.len(), "feedback resolved");
        Ok(moved)
    }

    /// Moves an item from resolved back to active as a draft.
    ///
    /// The previous submission time is not restored.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the key is not resolved;
    /// [`StoreError::Conflict`] if another active item already starts on the
    /// same line of the same file;
    /// [`StoreError::Storage`] if a file cannot be written.
    pub async fn unresolve(&self, key: &ItemKey) -> Result<FeedbackItem, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut resolved = self.read_resolved().await;
        let Some(mut item) = resolved.remove(key) else {
            return Err(StoreError::NotFound(key.clone()));
        };
        let mut active = self.read_active().await;
        if let Some(holder) = same_anchor(&active, key).into_iter().find(|k| k != key) {
            return Err(StoreError::Conflict(format!(
                "{holder} already comments on that line; delete or resolve it before reopening {key}"
            )));
        }
        item.status = FeedbackStatus::Draft;
        active.insert(key.clone(), item.clone());

        self.write_collection(&self.active_path(), &active).await?;
        self.write_collection(&self.resolved_path(), &resolved).await?;
        info!(root = %self.root.display(), key = %key, "feedback reopened");
        Ok(item)
    }

    /// Removes an item from whichever collection holds it, active first.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the item is still active and submitted;
    /// [`StoreError::NotFound`] if neither collection holds the key;
    /// [`StoreError::Storage`] if a file cannot be written.
    pub async fn delete(&self, key: &ItemKey) -> Result<FeedbackItem, StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut active = self.read_active().await;
        if let Some(existing) = active.get(key) {
            if let FeedbackStatus::Submitted { .. } = existing.status {
                return Err(StoreError::Conflict(format!(
                    "{key} was submitted to the agent; resolve it before deleting"
                )));
            }
            let removed = active.remove(key).ok_or_else(|| StoreError::NotFound(key.clone()))?;
            self.write_collection(&self.active_path(), &active).await?;
            debug!(root = %self.root.display(), key = %key, "active feedback deleted");
            return Ok(removed);
        }

        let mut resolved = self.read_resolved().await;
        let Some(removed) = resolved.remove(key) else {
            return Err(StoreError::NotFound(key.clone()));
        };
        self.write_collection(&self.resolved_path(), &resolved).await?;
        debug!(root = %self.root.display(), key = %key, "resolved feedback deleted");
        Ok(removed)
    }

    /// Stamps `submitted_at` on every draft and returns the whole active set.
    ///
    /// Items that are already submitted keep their original time, so calling
    /// this again without new drafts changes nothing on disk.
    ///
    /// # Errors
    ///
    /// [`StoreError::Storage`] if the active file cannot be written.
    pub async fn submit_all(&self) -> Result<Vec<FeedbackItem>, StoreError> {
        self.stamp_submitted(|_| true).await
    }

    /// Like [`Self::submit_all`], restricted to `keys`.
    ///
    /// Used after a hand-off has reached the agent: drafts added since the
    /// snapshot was taken stay drafts. Keys no longer active are skipped.
    pub async fn mark_submitted(&self, keys: &[ItemKey]) -> Result<Vec<FeedbackItem>, StoreError> {
        self.stamp_submitted(|key| keys.contains(key)).await
    }

    async fn stamp_submitted(&self, select: impl Fn(&ItemKey) -> bool) -> Result<Vec<FeedbackItem>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut active = self.read_active().await;
        let now = now();
        let mut stamped = 0usize;
        for (key, item) in active.iter_mut() {
            if item.status == FeedbackStatus::Draft && select(key) {
                item.status = FeedbackStatus::Submitted { at: now };
                stamped += 1;
            }
        }
        if stamped > 0 {
            self.write_collection(&self.active_path(), &active).await?;
        }
        info!(root = %self.root.display(), stamped, total = active.len(), "feedback submitted");
        Ok(active.into_values().collect())
    }

    /// Writes `items` to a hand-off document named after `id`.
    ///
    /// File paths are rewritten to absolute paths under the root so the
    /// agent can open them from any working directory. The store's own
    /// collections are not touched.
    ///
    /// # Errors
    ///
    /// [`StoreError::Validation`] if `id` is not a plain token;
    /// [`StoreError::Storage`] / [`StoreError::Encode`] on write failure.
    pub async fn write_handoff(&self, items: &[FeedbackItem], id: &str) -> Result<PathBuf, StoreError> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(StoreError::Validation(format!("invalid hand-off id: {id:?}")));
        }
        let absolute: Vec<FeedbackItem> = items
            .iter()
            .map(|item| FeedbackItem {
                file_path: self.root.join(&item.file_path).display().to_string(),
                ..item.clone()
            })
            .collect();
        let path = self.handoff_path(id);
        let body = schema::encode(&absolute)?;
        write_atomic(&path, body.as_bytes()).await?;
        info!(path = %path.display(), items = absolute.len(), "hand-off written");
        Ok(path)
    }

    async fn read_active(&self) -> Collection {
        let active = self.active_path();
        match schema::ensure_migrated(&active, &self.legacy_path()).await {
            Ok(true) => info!(path = %active.display(), "seeded feedback from legacy file"),
            Ok(false) => {}
            Err(err) => warn!(path = %active.display(), %err, "legacy feedback migration failed"),
        }
        into_collection(read_items(&active).await)
    }

    async fn read_resolved(&self) -> Collection {
        into_collection(read_items(&self.resolved_path()).await)
    }

    async fn write_collection(&self, path: &Path, items: &Collection) -> Result<(), StoreError> {
        let items: Vec<FeedbackItem> = items.values().cloned().collect();
        let body = schema::encode(&items)?;
        write_atomic(path, body.as_bytes()).await
    }
}

/// Current time at the precision timestamps are stored with, so a value
/// returned from an operation equals the one read back later.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Reads a collection file; any failure degrades to an empty collection.
async fn read_items(path: &Path) -> Vec<FeedbackItem> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => schema::decode(&raw, path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            warn!(path = %path.display(), %err, "unreadable feedback file, treating as empty");
            Vec::new()
        }
    }
}

/// Replaces `path` with `body` via a synced `.tmp` sibling and a rename.
///
/// A crash before the rename leaves the previous file intact. The temp file
/// is removed on every error path.
async fn write_atomic(path: &Path, body: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::storage(parent, e))?;
    }
    let tmp_path = {
        let name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "feedback.yaml".to_owned());
        path.with_file_name(format!("{name}.tmp"))
    };

    let written: std::io::Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(body).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(StoreError::storage(&tmp_path, err));
    }
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(StoreError::storage(path, err));
    }
    Ok(())
}

/// Hands out one shared [`FeedbackStore`] per canonical root.
///
/// Two stores for the same root would each hold their own lock and race on
/// the same files, so every caller goes through here.
#[derive(Debug, Default)]
pub struct StoreRegistry {
    stores: StdMutex<HashMap<PathBuf, Arc<FeedbackStore>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, root: impl AsRef<Path>) -> Arc<FeedbackStore> {
        let canonical = paths::canonical_root(root.as_ref());
        let mut stores = self.stores.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            stores
                .entry(canonical.clone())
                .or_insert_with(|| Arc::new(FeedbackStore::open(&canonical))),
        )
    }
}
