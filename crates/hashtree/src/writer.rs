use std::io::Write;

use dfl_common::{DflError, Result};
use serde::{Deserialize, Serialize};

use crate::tree::FileNode;

pub(crate) const TREE_MAGIC: &[u8; 4] = b"DFLT";
pub(crate) const TREE_VERSION: u32 = 1;
pub(crate) const TREE_HEADER_LEN: usize = 8;

const INDEX_MAGIC: &[u8; 4] = b"DFLI";
const INDEX_VERSION: u32 = 1;
const INDEX_HEADER_LEN: usize = 12;

/// Suffix appended to a tree's block path to locate its index sidecar.
pub const INDEX_PATH: &str = ".index";

/// Byte offset of one tree record, keyed by path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Absolute record path.
    pub path: String,
    /// Byte offset of the record's length prefix within the serialized tree.
    pub offset: u64,
}

/// Streaming tree writer producing the serialized record format.
///
/// Tracks the logical size (sum of leaf sizes) and a path-to-offset index that
/// callers store as a sidecar next to the uploaded tree.
pub struct Writer<W: Write> {
    w: W,
    offset: u64,
    size: u64,
    last_path: Option<String>,
    index: Vec<IndexEntry>,
}

impl<W: Write> Writer<W> {
    /// Start a new serialized tree on `w`, emitting the header.
    pub fn new(mut w: W) -> Result<Self> {
        w.write_all(TREE_MAGIC)?;
        w.write_all(&TREE_VERSION.to_le_bytes())?;
        Ok(Self {
            w,
            offset: TREE_HEADER_LEN as u64,
            size: 0,
            last_path: None,
            index: Vec::new(),
        })
    }

    /// Append one record. Paths must arrive in strictly ascending order.
    pub fn write(&mut self, node: &FileNode) -> Result<()> {
        if let Some(last) = &self.last_path {
            if node.path.as_str() <= last.as_str() {
                return Err(DflError::Storage(format!(
                    "tree records out of order: {:?} after {:?}",
                    node.path, last
                )));
            }
        }
        let payload = serde_json::to_vec(node)
            .map_err(|e| DflError::Storage(format!("tree record encode failed: {e}")))?;
        self.index.push(IndexEntry {
            path: node.path.clone(),
            offset: self.offset,
        });
        self.w.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.w.write_all(&payload)?;
        self.offset += 4 + payload.len() as u64;
        self.size += node.size;
        self.last_path = Some(node.path.clone());
        Ok(())
    }

    /// Logical size: the sum of all written leaf sizes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Encode the path index as a framed sidecar blob.
    pub fn index(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(&self.index)
            .map_err(|e| DflError::Storage(format!("tree index encode failed: {e}")))?;
        let mut out = Vec::with_capacity(INDEX_HEADER_LEN + json.len());
        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }
}

/// Decode a framed index sidecar blob.
pub fn decode_index(bytes: &[u8]) -> Result<Vec<IndexEntry>> {
    if bytes.len() < INDEX_HEADER_LEN {
        return Err(DflError::Storage(
            "index blob is too small to contain header".to_string(),
        ));
    }
    if &bytes[0..4] != INDEX_MAGIC {
        return Err(DflError::Storage("invalid index blob magic".to_string()));
    }
    let _version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    if bytes.len() < INDEX_HEADER_LEN + len {
        return Err(DflError::Storage(
            "index blob payload length is invalid".to_string(),
        ));
    }
    let payload = &bytes[INDEX_HEADER_LEN..INDEX_HEADER_LEN + len];
    serde_json::from_slice(payload)
        .map_err(|e| DflError::Storage(format!("index blob decode failed: {e}")))
}
