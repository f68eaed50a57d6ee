//! Wire protocol and local endpoint addressing.
//!
//! Pure data shapes plus the address-discovery helper; no behavior lives
//! here. The RPC transport itself (a JSON-framed `tarpc` channel over a
//! Unix domain socket) is wired up by the coordinator and worker binaries.

use std::path::PathBuf;

use nix::unistd::getuid;
use serde::{Deserialize, Serialize};

/// One intermediate key/value pair, as produced by Map and consumed by Reduce.
///
/// Field names are capitalized to match the on-disk record shape required
/// by §6: `{"Key": "...", "Value": "..."}` per line of a partition file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// What `GetTask` hands back to a polling worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskAssignment {
    /// Map `file` (tagged with `map_id`) against an `n_reduce`-way partitioning.
    Map {
        file: String,
        map_id: u32,
        n_reduce: u32,
    },
    /// Reduce every partition file addressed to `reduce_id`.
    Reduce { reduce_id: u32 },
    /// No task is available right now; poll again shortly.
    Retry,
}

#[tarpc::service]
pub trait CoordinatorService {
    /// Idempotent: may be called any number of times. A successful call
    /// that returns `TaskAssignment::Map` or `::Reduce` leases that task.
    async fn get_task() -> TaskAssignment;

    /// Idempotent on a missing entry; removes the map task if present.
    async fn complete_map_task(file: String);

    /// Idempotent on a missing entry; removes the reduce task if present.
    async fn complete_reduce_task(reduce_id: u32);
}

/// The local-domain socket path this job's coordinator and workers rendezvous
/// on. Keyed by effective uid so multiple users on one host do not collide.
pub fn socket_path() -> PathBuf {
    PathBuf::from(format!("/var/tmp/824-mr-{}", getuid()))
}
