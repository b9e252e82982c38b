use std::io::Write;

use dfl_common::Result;
use serde::{Deserialize, Serialize};

use crate::writer::Writer;

/// Reference to the stored block backing a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Block id within the object store.
    pub block: String,
    /// Byte range start within the block.
    pub lower: u64,
    /// Byte range end within the block.
    pub upper: u64,
}

/// One leaf record of a serialized tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Absolute path of the file within the tree.
    pub path: String,
    /// Content hash; empty for marker entries.
    pub hash: String,
    /// Logical size in bytes.
    pub size: u64,
    /// Block reference, when the content lives in a single stored block.
    #[serde(default)]
    pub block_ref: Option<BlockRef>,
}

fn join_path(root: &str, rel: &str) -> String {
    let rel = rel.trim_start_matches('/');
    if root.is_empty() || root == "/" {
        format!("/{rel}")
    } else {
        format!("{root}/{rel}")
    }
}

/// Tree builder whose serialized records are emitted in path order.
pub struct Ordered {
    root: String,
    entries: Vec<FileNode>,
}

impl Ordered {
    /// Create an empty tree rooted at `root`.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            entries: Vec::new(),
        }
    }

    /// Add a leaf under the tree root.
    pub fn put_file(&mut self, path: &str, hash: &str, size: u64, block_ref: Option<BlockRef>) {
        self.entries.push(FileNode {
            path: join_path(&self.root, path),
            hash: hash.to_string(),
            size,
            block_ref,
        });
    }

    /// Number of leaves currently in the tree.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tree holds no leaves.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the tree in the serialized record format.
    pub fn serialize<W: Write>(&self, w: W) -> Result<()> {
        let mut nodes = self.entries.clone();
        nodes.sort_by(|a, b| a.path.cmp(&b.path));
        let mut writer = Writer::new(w)?;
        for node in &nodes {
            writer.write(node)?;
        }
        Ok(())
    }

    /// Serialize into an owned buffer.
    pub fn serialize_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.serialize(&mut buf)?;
        Ok(buf)
    }
}

/// Tree builder accepting arbitrary insertion order and nested relative paths.
pub struct Unordered {
    root: String,
    entries: Vec<FileNode>,
}

impl Unordered {
    /// Create an empty tree rooted at `root`.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            entries: Vec::new(),
        }
    }

    /// Add a leaf under the tree root.
    pub fn put_file(&mut self, path: &str, hash: &str, size: u64, block_ref: Option<BlockRef>) {
        self.entries.push(FileNode {
            path: join_path(&self.root, path),
            hash: hash.to_string(),
            size,
            block_ref,
        });
    }

    /// Convert into the ordered form used for serialization.
    pub fn ordered(self) -> Ordered {
        Ordered {
            root: self.root,
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::reader::Reader;

    #[test]
    fn serialize_emits_records_in_path_order() {
        let mut tree = Unordered::new("/d1");
        tree.put_file("stats", "h2", 10, None);
        tree.put_file("index", "h1", 1, None);
        tree.put_file("job:abc", "", 0, None);

        let buf = tree.ordered().serialize_to_vec().expect("serialize");
        let reader = Reader::new(Cursor::new(&buf), None).expect("reader");
        let paths: Vec<String> = reader
            .read_all()
            .expect("read")
            .into_iter()
            .map(|n| n.path)
            .collect();
        assert_eq!(paths, vec!["/d1/index", "/d1/job:abc", "/d1/stats"]);
    }

    #[test]
    fn root_slash_does_not_double_up() {
        let mut tree = Ordered::new("/");
        tree.put_file("a.txt", "h", 1, None);
        let buf = tree.serialize_to_vec().expect("serialize");
        let nodes = Reader::new(Cursor::new(&buf), None)
            .expect("reader")
            .read_all()
            .expect("read");
        assert_eq!(nodes[0].path, "/a.txt");
    }

    #[test]
    fn empty_tree_serializes_to_header_only() {
        let tree = Ordered::new("/out");
        let buf = tree.serialize_to_vec().expect("serialize");
        let nodes = Reader::new(Cursor::new(&buf), None)
            .expect("reader")
            .read_all()
            .expect("read");
        assert!(nodes.is_empty());
    }
}
