//! DatumFlow transform worker core.
//!
//! Architecture role:
//! - classifies coordinator-issued subtasks and drives the matching handler
//! - fans datum processing out under a bounded concurrency gate with
//!   cancel-on-first-error semantics
//! - caches per-subtask output trees, publishes merged chunks for peer
//!   workers, and serves them over the `GetChunk` stream
//! - assembles one shard of the final output tree from chunks and an
//!   optional parent tree
//!
//! Key modules:
//! - [`dispatch`] — subtask classification and routing
//! - [`datum`] — the per-datum pipeline (cache probe, retries, recovery)
//! - [`merge`] — chunk download and shard merge
//! - [`driver`] — the seam to staging, user code, and per-job caches
//! - [`server`] — peer chunk RPC service and client
//! - [`s3gateway`] — sidecar readiness probe
//! - [`status`] — live worker status surface
//! - [`task`] / [`stats`] / [`tags`] — payloads, accounting, tag naming

pub mod datum;
pub mod dispatch;
pub mod driver;
pub mod logs;
pub mod merge;
pub mod s3gateway;
pub mod server;
pub mod stats;
pub mod status;
pub mod tags;
pub mod task;
pub mod testing;

pub use dispatch::handle_subtask;
pub use driver::{capture_output, stage_inputs, CacheRegistry, Driver, LocalDriver, StagedData};
pub use logs::DatumLogger;
pub use stats::{merge_stats, DatumStats, ProcessStats};
pub use status::{Status, StatusSnapshot};
pub use task::{
    deserialize_datum_data, deserialize_merge_data, serialize_datum_data, serialize_merge_data,
    Commit, DatumData, DatumInputs, DatumInputsList, File, FileInfo, HashtreeInfo, Input,
    MergeData, ObjectRef, RecoveredDatums, Subtask,
};
