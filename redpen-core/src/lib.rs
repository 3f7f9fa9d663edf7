//! Core of redpen: the feedback store and the shared filesystem watcher.
//!
//! - [`store`]: review comments anchored to file/line ranges, persisted as
//!   YAML collections under `<root>/.redpen/` with a draft → submitted →
//!   resolved lifecycle.
//! - [`watch`]: one debounced native watcher per root, fanned out to any
//!   number of subscribers.

pub mod error;
pub mod paths;
pub mod schema;
pub mod store;
pub mod types;
pub mod watch;

pub use error::{StoreError, WatchError};
pub use store::{FeedbackStore, StoreRegistry};
pub use types::{ChangeEvent, ChangeKind, FeedbackItem, FeedbackStatus, ItemKey};
pub use watch::{Subscription, WatchConfig, WatchRegistry};
