use async_trait::async_trait;
use dfl_common::Result;
use dfl_hashtree::BlockRef;

/// Streaming byte source returned by tag/object reads.
///
/// Dropping the reader releases the underlying transport, so cancelling a
/// consumer cancels the read.
pub type ByteReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Handle to a stored content-addressed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// Hex content hash of the object bytes.
    pub hash: String,
}

/// Placement metadata for a stored object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Block holding the object's bytes.
    pub block_ref: BlockRef,
}

/// Incremental object writer handed out by [`ObjClient::put_object_async`].
///
/// Bytes are accepted through `io::Write`; `close` finalizes the object,
/// applies any tags given at creation, and returns the stored handle.
pub trait ObjWriter: std::io::Write + Send {
    /// Finalize the object and apply its tags.
    fn close(self: Box<Self>) -> Result<Object>;
}

/// The object-store surface the worker core consumes.
///
/// Hashes are hex strings end to end; tags are opaque strings naming one
/// object each. Readers are async so peer-streamed bodies plug in directly.
#[async_trait]
pub trait ObjClient: Send + Sync {
    /// Whether an object is stored under `tag`.
    async fn inspect_tag(&self, tag: &str) -> Result<bool>;

    /// Fetch the bytes stored under `tag`.
    async fn get_tag(&self, tag: &str) -> Result<Vec<u8>>;

    /// Open a streaming reader over the bytes stored under `tag`.
    async fn get_tag_reader(&self, tag: &str) -> Result<ByteReader>;

    /// Open a streaming reader over the object with the given hash.
    async fn get_object_reader(&self, hash: &str) -> Result<ByteReader>;

    /// Store `data` as a content-addressed object; returns the handle and size.
    async fn put_object(&self, data: &[u8]) -> Result<(Object, u64)>;

    /// Open an incremental writer whose finished object is tagged with `tags`.
    async fn put_object_async(&self, tags: Vec<String>) -> Result<Box<dyn ObjWriter>>;

    /// Placement metadata for a stored object.
    async fn inspect_object(&self, hash: &str) -> Result<ObjectInfo>;

    /// Write bytes at an explicit path, bypassing content addressing and tags.
    async fn put_direct(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Filesystem-style path of a block, used to place sidecar blobs.
    fn block_path(&self, block: &BlockRef) -> String;
}
