use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use dfl_common::{DflError, Result};

use crate::filter::Filter;
use crate::merge;
use crate::reader::Reader;
use crate::writer::Writer;

/// Thread-safe store of serialized trees keyed by tag.
///
/// `put` validates the buffer parses end to end before accepting it, so every
/// cached entry is guaranteed mergeable.
pub struct MergeCache {
    trees: Mutex<HashMap<String, Arc<Vec<u8>>>>,
}

impl MergeCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            trees: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Vec<u8>>>> {
        self.trees.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a serialized tree under `key`, validating the format first.
    pub fn put(&self, key: impl Into<String>, bytes: Vec<u8>) -> Result<()> {
        {
            let mut reader = Reader::new(Cursor::new(&bytes), None)?;
            while reader.next()?.is_some() {}
        }
        self.lock().insert(key.into(), Arc::new(bytes));
        Ok(())
    }

    /// Whether `key` holds a cached tree.
    pub fn has(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Snapshot of current keys.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Drop the entry under `key`, if any.
    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Number of cached trees.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the cache holds no trees.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy the tree under `key` into `w`, re-serialized through `filter`.
    pub fn get(&self, key: &str, w: &mut dyn Write, filter: Option<&Filter>) -> Result<()> {
        let buf = self
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| DflError::Storage(format!("no cached tree for key {key}")))?;
        let mut writer = Writer::new(w)?;
        let mut reader = Reader::new(Cursor::new(buf.as_slice()), filter.cloned())?;
        while let Some(node) = reader.next()? {
            writer.write(&node)?;
        }
        Ok(())
    }

    /// Merge every cached tree (plus an optional parent stream) into `writer`
    /// through `filter`. Trees are fed to the merge in key order so the output
    /// is deterministic for a given cache population.
    pub fn merge<W: Write>(
        &self,
        writer: &mut Writer<W>,
        parent: Option<&mut dyn Read>,
        filter: Option<&Filter>,
    ) -> Result<()> {
        let mut bufs: Vec<(String, Arc<Vec<u8>>)> = self
            .lock()
            .iter()
            .map(|(k, b)| (k.clone(), Arc::clone(b)))
            .collect();
        bufs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut readers = Vec::with_capacity(bufs.len() + 1);
        for (_, buf) in &bufs {
            readers.push(Reader::new(Cursor::new(buf.as_slice()), filter.cloned())?);
        }
        if let Some(parent) = parent {
            readers.push(Reader::new(parent, filter.cloned())?);
        }
        merge::merge(writer, readers)
    }
}

impl Default for MergeCache {
    fn default() -> Self {
        Self::new()
    }
}
