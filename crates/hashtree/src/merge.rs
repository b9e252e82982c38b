use std::cmp::Ordering;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io::Write;

use dfl_common::Result;
use sha2::{Digest, Sha256};

use crate::reader::Reader;
use crate::tree::FileNode;
use crate::writer::Writer;

struct HeapItem {
    node: FileNode,
    src: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.node
            .path
            .cmp(&other.node.path)
            .then_with(|| self.node.hash.cmp(&other.node.hash))
            .then_with(|| self.src.cmp(&other.src))
    }
}

/// K-way merge of serialized trees into `writer`.
///
/// Records with identical paths are combined: hashes are sorted, concatenated,
/// and re-hashed; sizes are summed; the block reference is dropped because the
/// combined content no longer maps to one block. The result is independent of
/// reader order.
pub fn merge<W: Write>(writer: &mut Writer<W>, mut readers: Vec<Reader<'_>>) -> Result<()> {
    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (src, reader) in readers.iter_mut().enumerate() {
        if let Some(node) = reader.next()? {
            heap.push(Reverse(HeapItem { node, src }));
        }
    }

    while let Some(Reverse(item)) = heap.pop() {
        if let Some(node) = readers[item.src].next()? {
            heap.push(Reverse(HeapItem {
                node,
                src: item.src,
            }));
        }
        let mut group = vec![item.node];
        loop {
            let same_path = matches!(heap.peek(), Some(Reverse(peek)) if peek.node.path == group[0].path);
            if !same_path {
                break;
            }
            let Some(Reverse(next)) = heap.pop() else {
                break;
            };
            if let Some(node) = readers[next.src].next()? {
                heap.push(Reverse(HeapItem {
                    node,
                    src: next.src,
                }));
            }
            group.push(next.node);
        }
        let merged = if group.len() == 1 {
            group.remove(0)
        } else {
            combine(group)
        };
        writer.write(&merged)?;
    }
    Ok(())
}

fn combine(mut group: Vec<FileNode>) -> FileNode {
    group.sort_by(|a, b| a.hash.cmp(&b.hash));
    let mut hasher = Sha256::new();
    let mut size = 0;
    for node in &group {
        hasher.update(node.hash.as_bytes());
        size += node.size;
    }
    FileNode {
        path: group[0].path.clone(),
        hash: format!("{:x}", hasher.finalize()),
        size,
        block_ref: None,
    }
}
