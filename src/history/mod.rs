//! History model: events, batches, tasks, and version histories.

pub mod types;
pub mod version_history;

pub use types::{
    BranchToken, FullHistory, HistoryBatch, HistoryEvent, RawReplicationTask, ReplicationTask,
    WorkflowIdentity,
};
pub use version_history::{
    compare, find_lowest_common_ancestor, is_prefix, HistoryOrdering, VersionHistories,
    VersionHistory, VersionHistoryItem, MAX_EVENT_ID,
};
