//! Peer chunk exchange: the `GetChunk` streaming service over the per-job
//! chunk caches, and the dialing client used by merge tasks.
//!
//! RPC schema source: `proto/dfl_worker.proto`.

use std::pin::Pin;
use std::sync::Arc;

use dfl_common::{DflError, Result};
use dfl_objstore::ByteReader;
use futures::Stream;
use tokio_stream::{self as stream, StreamExt};
use tokio_util::io::StreamReader;
use tonic::{Request, Response, Status as TonicStatus};
use tracing::debug;

use crate::driver::Driver;

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("dfl.worker.v1");
}

pub use v1::worker_client::WorkerClient;
pub use v1::worker_server::{Worker, WorkerServer};

const CHUNK_STREAM_BYTES: usize = 64 * 1024;

/// Serves cached chunks to peer workers.
///
/// Any tag currently in the job's chunk (or stats chunk) cache is served as
/// the raw cached bytes. Chunks are never shard-filtered here: the requester
/// caches the body in its own job-persistent cache and reuses it across
/// merge subtasks for different shards, so the shard filter must only be
/// applied locally at merge time.
#[derive(Clone)]
pub struct ChunkService {
    driver: Arc<dyn Driver>,
}

impl ChunkService {
    /// Build the service over the driver's cache registries.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }
}

#[tonic::async_trait]
impl Worker for ChunkService {
    type GetChunkStream =
        Pin<Box<dyn Stream<Item = std::result::Result<v1::GetChunkResponse, TonicStatus>> + Send>>;

    async fn get_chunk(
        &self,
        request: Request<v1::GetChunkRequest>,
    ) -> std::result::Result<Response<Self::GetChunkStream>, TonicStatus> {
        let req = request.into_inner();
        let registry = if req.stats {
            self.driver.chunk_stats_caches()
        } else {
            self.driver.chunk_caches()
        };
        let cache = registry.get_or_create(&req.job_id);
        if !cache.has(&req.tag) {
            return Err(TonicStatus::not_found(format!(
                "no cached chunk for tag {}",
                req.tag
            )));
        }

        let mut buf = Vec::new();
        cache.get(&req.tag, &mut buf, None).map_err(to_status)?;
        debug!(tag = %req.tag, shard = req.shard, len = buf.len(), "serving cached chunk");

        let mut chunks = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            let end = (offset + CHUNK_STREAM_BYTES).min(buf.len());
            chunks.push(Ok(v1::GetChunkResponse {
                chunk: buf[offset..end].to_vec(),
            }));
            offset = end;
        }
        Ok(Response::new(Box::pin(stream::iter(chunks))))
    }
}

fn to_status(err: DflError) -> TonicStatus {
    TonicStatus::internal(err.to_string())
}

/// Dial the worker at `address` (`host:port`) and stream a cached chunk.
///
/// Dropping the returned reader drops the RPC stream, cancelling the call.
pub async fn fetch_chunk_from_worker(
    address: &str,
    job_id: &str,
    tag: &str,
    shard: i64,
    stats: bool,
) -> Result<ByteReader> {
    let mut client = WorkerClient::connect(format!("http://{address}"))
        .await
        .map_err(|e| DflError::Storage(format!("worker connect failed: {e}")))?;
    let chunk_stream = client
        .get_chunk(v1::GetChunkRequest {
            job_id: job_id.to_string(),
            tag: tag.to_string(),
            shard,
            stats,
        })
        .await
        .map_err(|e| DflError::Storage(format!("get chunk rpc failed: {e}")))?
        .into_inner();

    let byte_stream = chunk_stream.map(|item| {
        item.map(|resp| bytes::Bytes::from(resp.chunk))
            .map_err(std::io::Error::other)
    });
    Ok(Box::new(StreamReader::new(byte_stream)))
}
