//! Replication task wire codec.
//!
//! Tasks travel as a JSON envelope, optionally zstd-compressed. Compression is
//! detected from the zstd magic header so producers may mix both forms on one
//! stream. When the transport carries a SHA-256 of the decompressed payload,
//! it is verified before parsing.

use crate::error::{ReplicationError, Result};
use crate::history::{FullHistory, RawReplicationTask, ReplicationTask, WorkflowIdentity};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::io::Read;

/// zstd magic bytes for decompression detection
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// zstd level used by producers that compress.
const COMPRESSION_LEVEL: i32 = 3;

/// Encode a task for publishing.
pub fn encode_task(task: &ReplicationTask, compress: bool) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(task)?;
    if compress {
        zstd::encode_all(&json[..], COMPRESSION_LEVEL)
            .map_err(|e| ReplicationError::Serialization(format!("zstd encode: {}", e)))
    } else {
        Ok(json)
    }
}

/// Build the raw form of a task, as a transport would deliver it.
pub fn to_raw(task: &ReplicationTask, compress: bool) -> Result<RawReplicationTask> {
    let payload = encode_task(task, compress)?;
    let mut raw = RawReplicationTask::new(task.source_cluster.clone(), task.task_id, payload);
    raw.content_hash = Some(compute_content_hash(&serde_json::to_vec(task)?));
    Ok(raw)
}

/// Decode a raw task.
///
/// The envelope's `source_cluster` and `task_id` must match what the transport
/// delivered; a task that lies about its position cannot be ordered.
pub fn decode_task(raw: &RawReplicationTask) -> Result<ReplicationTask> {
    let data = maybe_decompress(&raw.payload)?;

    if let Some(ref expected) = raw.content_hash {
        let computed = compute_content_hash(&data);
        if &computed != expected {
            return Err(ReplicationError::Serialization(format!(
                "content hash mismatch for task {}/{}: expected {}, got {}",
                raw.source_cluster, raw.task_id, expected, computed
            )));
        }
    }

    let task: ReplicationTask = serde_json::from_slice(&data)?;
    if task.task_id != raw.task_id || task.source_cluster != raw.source_cluster {
        return Err(ReplicationError::Serialization(format!(
            "envelope {}/{} delivered as {}/{}",
            task.source_cluster, task.task_id, raw.source_cluster, raw.task_id
        )));
    }
    Ok(task)
}

/// Envelope fields needed for routing; everything else is skipped.
#[derive(Deserialize)]
struct RoutingKey {
    domain_id: String,
    workflow_id: String,
    run_id: String,
}

/// Read only the run identity of a raw task, without validating it.
///
/// `None` when the payload cannot be parsed that far.
pub fn peek_identity(raw: &RawReplicationTask) -> Option<WorkflowIdentity> {
    let data = maybe_decompress(&raw.payload).ok()?;
    let key: RoutingKey = serde_json::from_slice(&data).ok()?;
    Some(WorkflowIdentity::new(key.domain_id, key.workflow_id, key.run_id))
}

pub fn encode_full_history(history: &FullHistory) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(history)?)
}

pub fn decode_full_history(data: &[u8]) -> Result<FullHistory> {
    let data = maybe_decompress(data)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| ReplicationError::Serialization(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| ReplicationError::Serialization(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Compute SHA256 content hash as hex string.
pub fn compute_content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
