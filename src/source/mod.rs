//! Replication task sources.
//!
//! A source delivers the ordered task stream of each remote cluster and serves
//! full histories for backfill. Tasks arrive raw; decoding happens on the
//! worker so an undecodable payload can still be parked in the DLQ.

pub mod codec;
pub mod memory;
pub mod redis_stream;

pub use memory::InMemoryTaskSource;
pub use redis_stream::RedisTaskSource;

use crate::history::{FullHistory, RawReplicationTask, WorkflowIdentity};
use crate::storage::BoxFuture;

/// Where replication tasks come from.
pub trait ReplicationTaskSource: Send + Sync + 'static {
    /// Tasks of `source_cluster` with `task_id > after_task_id`, ascending,
    /// at most `max_batch`. Empty means caught up.
    fn pull<'a>(
        &'a self,
        source_cluster: &'a str,
        after_task_id: i64,
        max_batch: usize,
    ) -> BoxFuture<'a, Vec<RawReplicationTask>>;

    /// The complete history of a run as `source_cluster` knows it.
    fn fetch_full_history<'a>(
        &'a self,
        source_cluster: &'a str,
        identity: &'a WorkflowIdentity,
    ) -> BoxFuture<'a, FullHistory>;
}
