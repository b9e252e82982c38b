//! Subtask payloads and the input file model.
//!
//! A subtask payload is JSON bytes in exactly one of two shapes: a datum
//! batch ([`DatumData`]) or a shard merge ([`MergeData`]). The dispatcher
//! classifies by attempting a structured decode of each; the variants share
//! no required fields, so a payload can never decode as both.

use dfl_common::{DflError, Result};
use serde::{Deserialize, Serialize};

use crate::stats::DatumStats;

/// Coordinator-issued work item: a datum batch or a shard merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Opaque subtask id, unique within the job.
    pub id: String,
    /// Encoded [`DatumData`] or [`MergeData`].
    pub payload: Vec<u8>,
}

/// Commit identifier within the versioned filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Opaque commit id.
    pub id: String,
}

/// A file within a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Commit the file belongs to.
    pub commit: Commit,
    /// Path of the file within the commit.
    pub path: String,
}

/// File identity plus content addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// The file's location.
    pub file: File,
    /// Hex content hash of the file bytes.
    pub hash: String,
    /// Size of the file in bytes.
    #[serde(default)]
    pub size_bytes: u64,
}

/// One named input of a datum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Name the input is staged and exported under.
    pub name: String,
    /// The backing file.
    pub file_info: FileInfo,
}

/// Handle to an immutable content-addressed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Hex content hash of the object.
    pub hash: String,
}

/// One datum as produced by the datum factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumInputs {
    /// Position of the datum in factory order.
    pub index: i64,
    /// Ordered input list; part of the datum's content hash.
    pub inputs: Vec<Input>,
}

/// The object stored behind [`DatumData::datums`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumInputsList {
    /// All datums assigned to the subtask.
    pub datums: Vec<DatumInputs>,
}

/// Where a published chunk can be fetched from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashtreeInfo {
    /// `host:port` of the producing worker; empty when only the object store
    /// holds the chunk.
    #[serde(default)]
    pub address: String,
    /// Tag the chunk is stored under.
    pub tag: String,
}

/// Datum-batch payload. Output fields are filled by the handler and travel
/// back to the coordinator in the re-encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumData {
    /// Job this subtask belongs to; selects the per-job chunk caches.
    pub job_id: String,
    /// Handle to the stored [`DatumInputsList`].
    pub datums: ObjectRef,
    /// Commit user-code output is written against.
    pub output_commit: Commit,
    /// Aggregated stats over all datums (output).
    #[serde(default)]
    pub stats: Option<DatumStats>,
    /// Location of this subtask's merged output chunk (output).
    #[serde(default)]
    pub chunk_hashtree: Option<HashtreeInfo>,
    /// Tag of the recovered-datum list (output).
    #[serde(default)]
    pub recovered_datums_tag: Option<String>,
    /// Location of this subtask's merged stats chunk (output).
    #[serde(default)]
    pub stats_hashtree: Option<HashtreeInfo>,
}

/// Shard-merge payload. `tree`/`tree_size` are outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeData {
    /// Job whose chunks are merged.
    pub job_id: String,
    /// Shard of the output tree this merge produces.
    pub shard: i64,
    /// Whether to merge stats chunks instead of output chunks.
    #[serde(default)]
    pub stats: bool,
    /// Chunks to merge, in coordinator order.
    pub hashtrees: Vec<HashtreeInfo>,
    /// Prior job's tree for incremental builds.
    #[serde(default)]
    pub parent: Option<ObjectRef>,
    /// Resulting shard tree (output).
    #[serde(default)]
    pub tree: Option<ObjectRef>,
    /// Logical byte size of the resulting tree (output).
    #[serde(default)]
    pub tree_size: u64,
}

/// Content hashes of datums whose error handler succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredDatums {
    /// Datum content hashes, in completion order.
    pub hashes: Vec<String>,
}

/// Encode a datum payload.
pub fn serialize_datum_data(data: &DatumData) -> Result<Vec<u8>> {
    serde_json::to_vec(data)
        .map_err(|e| DflError::Execution(format!("datum payload encode failed: {e}")))
}

/// Decode a datum payload.
pub fn deserialize_datum_data(payload: &[u8]) -> Result<DatumData> {
    serde_json::from_slice(payload)
        .map_err(|e| DflError::Execution(format!("datum payload decode failed: {e}")))
}

/// Encode a merge payload.
pub fn serialize_merge_data(data: &MergeData) -> Result<Vec<u8>> {
    serde_json::to_vec(data)
        .map_err(|e| DflError::Execution(format!("merge payload encode failed: {e}")))
}

/// Decode a merge payload.
pub fn deserialize_merge_data(payload: &[u8]) -> Result<MergeData> {
    serde_json::from_slice(payload)
        .map_err(|e| DflError::Execution(format!("merge payload decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input(name: &str) -> Input {
        Input {
            name: name.to_string(),
            file_info: FileInfo {
                file: File {
                    commit: Commit {
                        id: "c1".to_string(),
                    },
                    path: format!("{name}.txt"),
                },
                hash: format!("hash-{name}"),
                size_bytes: 3,
            },
        }
    }

    #[test]
    fn datum_payload_roundtrip_is_lossless() {
        let data = DatumData {
            job_id: "j1".to_string(),
            datums: ObjectRef {
                hash: "abc".to_string(),
            },
            output_commit: Commit {
                id: "out".to_string(),
            },
            stats: Some(DatumStats {
                datums_processed: 2,
                ..DatumStats::default()
            }),
            chunk_hashtree: Some(HashtreeInfo {
                address: "10.0.0.1:1080".to_string(),
                tag: "job-j1-chunk-s1".to_string(),
            }),
            recovered_datums_tag: None,
            stats_hashtree: None,
        };
        let bytes = serialize_datum_data(&data).expect("encode");
        let back = deserialize_datum_data(&bytes).expect("decode");
        assert_eq!(back.job_id, "j1");
        assert_eq!(back.stats.expect("stats").datums_processed, 2);
        assert_eq!(back.chunk_hashtree, data.chunk_hashtree);
    }

    #[test]
    fn merge_payload_roundtrip_is_lossless() {
        let data = MergeData {
            job_id: "j1".to_string(),
            shard: 3,
            stats: true,
            hashtrees: vec![HashtreeInfo {
                address: String::new(),
                tag: "t1".to_string(),
            }],
            parent: Some(ObjectRef {
                hash: "p".to_string(),
            }),
            tree: None,
            tree_size: 0,
        };
        let bytes = serialize_merge_data(&data).expect("encode");
        let back = deserialize_merge_data(&bytes).expect("decode");
        assert_eq!(back.shard, 3);
        assert!(back.stats);
        assert_eq!(back.hashtrees.len(), 1);
        assert_eq!(back.parent, data.parent);
    }

    #[test]
    fn payload_shapes_never_cross_decode() {
        let datum = DatumData {
            job_id: "j1".to_string(),
            datums: ObjectRef {
                hash: "abc".to_string(),
            },
            output_commit: Commit {
                id: "out".to_string(),
            },
            stats: None,
            chunk_hashtree: None,
            recovered_datums_tag: None,
            stats_hashtree: None,
        };
        let merge = MergeData {
            job_id: "j1".to_string(),
            shard: 0,
            stats: false,
            hashtrees: Vec::new(),
            parent: None,
            tree: None,
            tree_size: 0,
        };
        let datum_bytes = serialize_datum_data(&datum).expect("encode datum");
        let merge_bytes = serialize_merge_data(&merge).expect("encode merge");

        assert!(deserialize_merge_data(&datum_bytes).is_err());
        assert!(deserialize_datum_data(&merge_bytes).is_err());
        assert!(deserialize_datum_data(b"not json").is_err());
    }

    #[test]
    fn datum_inputs_list_roundtrips() {
        let list = DatumInputsList {
            datums: vec![DatumInputs {
                index: 7,
                inputs: vec![sample_input("a"), sample_input("b")],
            }],
        };
        let bytes = serde_json::to_vec(&list).expect("encode");
        let back: DatumInputsList = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(back, list);
    }
}
