//! Dead-letter queue for tasks that could not be applied.
//!
//! [`DlqStore`] persists entries and retry bookkeeping in SQLite;
//! [`DlqManager`] is the read/write/admin surface on top of it.

pub mod manager;
pub mod store;

pub use manager::{DlqManager, MergeReport};
pub use store::{BlockedPair, DlqEntry, DlqPage, DlqStore, RetryRecord};
