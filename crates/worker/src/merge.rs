//! Shard merge: gather chunks from peers or the object store, evict stale
//! cache entries, and stream the shard-filtered merge into a new tree.

use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::sync::Arc;

use dfl_common::{DflError, Result};
use dfl_hashtree::{Filter, Writer, INDEX_PATH};
use dfl_objstore::{ByteReader, Object};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::driver::Driver;
use crate::server::fetch_chunk_from_worker;
use crate::task::{HashtreeInfo, MergeData, ObjectRef};

const MERGE_DOWNLOAD_PARALLELISM: usize = 20;

/// Handle one shard-merge subtask end to end, populating `tree`/`tree_size`.
pub async fn handle_merge_task(driver: &Arc<dyn Driver>, data: &mut MergeData) -> Result<()> {
    let registry = if data.stats {
        driver.chunk_stats_caches()
    } else {
        driver.chunk_caches()
    };
    let cache = registry.get_or_create(&data.job_id);

    info!(
        job_id = %data.job_id,
        shard = data.shard,
        stats = data.stats,
        chunks = data.hashtrees.len(),
        "downloading hashtree chunks"
    );
    let cached_ids = cache.keys();
    let mut used_ids: HashSet<String> = HashSet::new();

    let limiter = Arc::new(Semaphore::new(MERGE_DOWNLOAD_PARALLELISM));
    let mut downloads: JoinSet<Result<()>> = JoinSet::new();
    for chunk_info in &data.hashtrees {
        used_ids.insert(chunk_info.tag.clone());
        if cache.has(&chunk_info.tag) {
            continue;
        }
        let permit = Arc::clone(&limiter)
            .acquire_owned()
            .await
            .map_err(|e| DflError::Execution(format!("download gate closed: {e}")))?;
        let driver = Arc::clone(driver);
        let cache = Arc::clone(&cache);
        let chunk_info = chunk_info.clone();
        let job_id = data.job_id.clone();
        let shard = data.shard;
        let stats = data.stats;
        downloads.spawn(async move {
            let _permit = permit;
            let mut reader = fetch_chunk(driver.as_ref(), &job_id, &chunk_info, shard, stats).await?;
            // Streamed bodies must be fully buffered before the merge reads them.
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| DflError::Storage(format!("chunk download failed: {e}")))?;
            cache.put(chunk_info.tag.as_str(), buf)
        });
    }

    let parent_download = data.parent.clone().map(|parent| {
        let driver = Arc::clone(driver);
        tokio::spawn(async move {
            let mut reader = driver.objstore().get_object_reader(&parent.hash).await?;
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| DflError::Storage(format!("parent tree download failed: {e}")))?;
            Ok::<Vec<u8>, DflError>(buf)
        })
    });

    let mut first_err: Option<DflError> = None;
    while let Some(joined) = downloads.join_next().await {
        let failed = match joined {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(err) => Some(DflError::Execution(format!(
                "chunk download join error: {err}"
            ))),
        };
        if let Some(err) = failed {
            if first_err.is_none() {
                first_err = Some(err);
            }
        }
    }

    // Entries cached by an earlier, retried run are dropped only after every
    // download settles.
    for id in cached_ids {
        if !used_ids.contains(&id) {
            cache.delete(&id);
        }
    }

    let parent_buf = match parent_download {
        Some(handle) => match handle.await {
            Ok(Ok(buf)) => Some(buf),
            Ok(Err(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
                None
            }
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(DflError::Execution(format!(
                        "parent download join error: {err}"
                    )));
                }
                None
            }
        },
        None => None,
    };
    if let Some(err) = first_err {
        return Err(err);
    }

    info!(job_id = %data.job_id, shard = data.shard, "merging hashtree chunks");
    let mut obj_writer = driver.objstore().put_object_async(Vec::new()).await?;
    let filter = Filter::new(driver.num_shards(), data.shard)?;
    let (size, index) = {
        let mut writer = Writer::new(&mut *obj_writer)?;
        let mut parent_cursor = parent_buf.map(Cursor::new);
        cache.merge(
            &mut writer,
            parent_cursor.as_mut().map(|c| c as &mut dyn Read),
            Some(&filter),
        )?;
        (writer.size(), writer.index()?)
    };
    let tree = obj_writer.close()?;
    write_index(driver.as_ref(), &tree, &index).await?;

    data.tree = Some(ObjectRef { hash: tree.hash });
    data.tree_size = size;
    Ok(())
}

/// Open a reader over a chunk, dialing the worker that produced it first and
/// silently falling back to the object store on any transport failure.
pub async fn fetch_chunk(
    driver: &dyn Driver,
    job_id: &str,
    info: &HashtreeInfo,
    shard: i64,
    stats: bool,
) -> Result<ByteReader> {
    if !info.address.is_empty() {
        match fetch_chunk_from_worker(&info.address, job_id, &info.tag, shard, stats).await {
            Ok(reader) => return Ok(reader),
            Err(err) => warn!(
                tag = %info.tag,
                address = %info.address,
                error = %err,
                "error fetching cached chunk from worker, fetching from object store instead"
            ),
        }
    }
    driver.objstore().get_tag_reader(&info.tag).await
}

async fn write_index(driver: &dyn Driver, tree: &Object, index: &[u8]) -> Result<()> {
    let objstore = driver.objstore();
    let info = objstore.inspect_object(&tree.hash).await?;
    let path = objstore.block_path(&info.block_ref);
    objstore
        .put_direct(&format!("{path}{INDEX_PATH}"), index)
        .await
}
