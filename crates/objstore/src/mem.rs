use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dfl_common::{DflError, Result};
use dfl_hashtree::BlockRef;
use sha2::{Digest, Sha256};

use crate::client::{ByteReader, ObjClient, ObjWriter, Object, ObjectInfo};

#[derive(Default)]
struct Store {
    objects: HashMap<String, Arc<Vec<u8>>>,
    tags: HashMap<String, String>,
    direct: HashMap<String, Vec<u8>>,
}

/// In-memory content-addressed store.
///
/// Clones share state, so a test can hand the same store to multiple drivers
/// the way workers of one cluster share a backing object store.
#[derive(Clone, Default)]
pub struct MemObjClient {
    store: Arc<Mutex<Store>>,
}

impl MemObjClient {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert_object(&self, data: Vec<u8>) -> (Object, u64) {
        let hash = hash_bytes(&data);
        let size = data.len() as u64;
        self.lock().objects.insert(hash.clone(), Arc::new(data));
        (Object { hash }, size)
    }

    /// Bytes stored at an explicit path by [`ObjClient::put_direct`], if any.
    pub fn direct_entry(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().direct.get(path).cloned()
    }

    /// Tags currently pointing at stored objects.
    pub fn tag_names(&self) -> Vec<String> {
        self.lock().tags.keys().cloned().collect()
    }
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl ObjClient for MemObjClient {
    async fn inspect_tag(&self, tag: &str) -> Result<bool> {
        Ok(self.lock().tags.contains_key(tag))
    }

    async fn get_tag(&self, tag: &str) -> Result<Vec<u8>> {
        let store = self.lock();
        let hash = store
            .tags
            .get(tag)
            .ok_or_else(|| DflError::Storage(format!("tag {tag} not found")))?;
        let bytes = store
            .objects
            .get(hash)
            .ok_or_else(|| DflError::Storage(format!("object {hash} not found")))?;
        Ok(bytes.as_ref().clone())
    }

    async fn get_tag_reader(&self, tag: &str) -> Result<ByteReader> {
        let bytes = self.get_tag(tag).await?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn get_object_reader(&self, hash: &str) -> Result<ByteReader> {
        let bytes = self
            .lock()
            .objects
            .get(hash)
            .cloned()
            .ok_or_else(|| DflError::Storage(format!("object {hash} not found")))?;
        Ok(Box::new(Cursor::new(bytes.as_ref().clone())))
    }

    async fn put_object(&self, data: &[u8]) -> Result<(Object, u64)> {
        Ok(self.insert_object(data.to_vec()))
    }

    async fn put_object_async(&self, tags: Vec<String>) -> Result<Box<dyn ObjWriter>> {
        Ok(Box::new(MemObjWriter {
            client: self.clone(),
            tags,
            buf: Vec::new(),
        }))
    }

    async fn inspect_object(&self, hash: &str) -> Result<ObjectInfo> {
        let store = self.lock();
        let bytes = store
            .objects
            .get(hash)
            .ok_or_else(|| DflError::Storage(format!("object {hash} not found")))?;
        Ok(ObjectInfo {
            block_ref: BlockRef {
                block: hash.to_string(),
                lower: 0,
                upper: bytes.len() as u64,
            },
        })
    }

    async fn put_direct(&self, path: &str, data: &[u8]) -> Result<()> {
        self.lock().direct.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    fn block_path(&self, block: &BlockRef) -> String {
        format!("/objects/{}", block.block)
    }
}

struct MemObjWriter {
    client: MemObjClient,
    tags: Vec<String>,
    buf: Vec<u8>,
}

impl std::io::Write for MemObjWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl ObjWriter for MemObjWriter {
    fn close(self: Box<Self>) -> Result<Object> {
        let (object, _) = self.client.insert_object(self.buf);
        let mut store = self.client.lock();
        for tag in &self.tags {
            store.tags.insert(tag.clone(), object.hash.clone());
        }
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn put_and_read_back_by_hash_and_tag() {
        let client = MemObjClient::new();
        let (object, size) = client.put_object(b"hello").await.expect("put");
        assert_eq!(size, 5);

        let mut reader = client
            .get_object_reader(&object.hash)
            .await
            .expect("object reader");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.expect("read");
        assert_eq!(out, b"hello");

        let mut writer = client
            .put_object_async(vec!["t1".to_string()])
            .await
            .expect("writer");
        writer.write_all(b"tagged bytes").expect("write");
        let tagged = writer.close().expect("close");

        assert!(client.inspect_tag("t1").await.expect("inspect"));
        assert!(!client.inspect_tag("t2").await.expect("inspect"));
        assert_eq!(client.get_tag("t1").await.expect("get"), b"tagged bytes");

        let info = client.inspect_object(&tagged.hash).await.expect("info");
        assert_eq!(info.block_ref.upper, 12);
        assert!(client.block_path(&info.block_ref).starts_with("/objects/"));
    }

    #[tokio::test]
    async fn identical_content_deduplicates() {
        let client = MemObjClient::new();
        let (a, _) = client.put_object(b"same").await.expect("put a");
        let (b, _) = client.put_object(b"same").await.expect("put b");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn direct_writes_bypass_tags() {
        let client = MemObjClient::new();
        client
            .put_direct("/objects/abc.index", b"idx")
            .await
            .expect("put direct");
        assert_eq!(client.direct_entry("/objects/abc.index").unwrap(), b"idx");
        assert!(client.tag_names().is_empty());
    }
}
