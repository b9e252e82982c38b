use std::io::{ErrorKind, Read};

use dfl_common::{DflError, Result};

use crate::filter::Filter;
use crate::tree::FileNode;
use crate::writer::{TREE_HEADER_LEN, TREE_MAGIC, TREE_VERSION};

/// Streaming tree reader over the serialized record format.
///
/// An optional [`Filter`] drops records whose path hashes to another shard.
pub struct Reader<'a> {
    r: Box<dyn Read + 'a>,
    filter: Option<Filter>,
}

impl<'a> Reader<'a> {
    /// Open a serialized tree, validating its header.
    pub fn new(r: impl Read + 'a, filter: Option<Filter>) -> Result<Self> {
        let mut r = Box::new(r) as Box<dyn Read + 'a>;
        let mut header = [0u8; TREE_HEADER_LEN];
        r.read_exact(&mut header)
            .map_err(|e| DflError::Storage(format!("serialized tree is missing its header: {e}")))?;
        if &header[0..4] != TREE_MAGIC {
            return Err(DflError::Storage("invalid tree magic".to_string()));
        }
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if version != TREE_VERSION {
            return Err(DflError::Storage(format!(
                "unsupported tree version {version}"
            )));
        }
        Ok(Self { r, filter })
    }

    /// Next record passing the filter, or `None` at end of stream.
    pub fn next(&mut self) -> Result<Option<FileNode>> {
        loop {
            let mut len_buf = [0u8; 4];
            match self.r.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            self.r
                .read_exact(&mut payload)
                .map_err(|e| DflError::Storage(format!("truncated tree record: {e}")))?;
            let node: FileNode = serde_json::from_slice(&payload)
                .map_err(|e| DflError::Storage(format!("tree record decode failed: {e}")))?;
            if let Some(filter) = &self.filter {
                if !filter.allows(&node.path) {
                    continue;
                }
            }
            return Ok(Some(node));
        }
    }

    /// Drain the remaining records into a vector.
    pub fn read_all(mut self) -> Result<Vec<FileNode>> {
        let mut out = Vec::new();
        while let Some(node) = self.next()? {
            out.push(node);
        }
        Ok(out)
    }
}
