//! Serialized content-tree format used for worker output exchange.
//!
//! Architecture role:
//! - defines the on-wire tree record format (leaf paths with content hashes)
//! - provides streaming read/write with a logical size and an index sidecar
//! - merges many trees through an optional shard filter
//! - hosts the thread-safe [`MergeCache`] the worker keys by tag
//!
//! Key modules:
//! - [`tree`]
//! - [`reader`] / [`writer`]
//! - [`merge`]
//! - [`filter`]
//! - [`cache`]

pub mod cache;
pub mod filter;
pub mod merge;
pub mod reader;
pub mod tree;
pub mod writer;

pub use cache::MergeCache;
pub use filter::{shard_of, Filter};
pub use merge::merge;
pub use reader::Reader;
pub use tree::{BlockRef, FileNode, Ordered, Unordered};
pub use writer::{decode_index, IndexEntry, Writer, INDEX_PATH};
