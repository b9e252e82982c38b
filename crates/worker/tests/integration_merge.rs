//! Shard-merge scenarios: peer fetch with object-store fallback, parent
//! merges, cache eviction, and the index sidecar.

mod support;

use std::io::Cursor;
use std::sync::Arc;

use dfl_common::PipelineInfo;
use dfl_hashtree::{merge, Filter, Ordered, Reader, Writer, INDEX_PATH};
use dfl_objstore::{MemObjClient, ObjClient};
use dfl_worker::server::{ChunkService, WorkerServer};
use dfl_worker::testing::{user_code, TestDriver};
use dfl_worker::{Driver, HashtreeInfo, ObjectRef};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

fn chunk_tree(prefix: &str, files: usize) -> Vec<u8> {
    let mut tree = Ordered::new("/");
    for i in 0..files {
        tree.put_file(&format!("{prefix}-{i}.txt"), &format!("h-{prefix}-{i}"), 1, None);
    }
    tree.serialize_to_vec().expect("serialize")
}

fn reference_merge(inputs: &[&[u8]], filter: &Filter) -> (Vec<u8>, u64) {
    let mut out = Vec::new();
    let size;
    {
        let mut writer = Writer::new(&mut out).expect("writer");
        let readers = inputs
            .iter()
            .map(|buf| Reader::new(Cursor::new(*buf), Some(filter.clone())).expect("reader"))
            .collect();
        merge(&mut writer, readers).expect("merge");
        size = writer.size();
    }
    (out, size)
}

fn scripted_driver(store: MemObjClient) -> Arc<TestDriver> {
    Arc::new(TestDriver::new(
        store,
        PipelineInfo::default(),
        user_code(|_, _| Ok(())),
    ))
}

async fn read_stored_tree(store: &MemObjClient, hash: &str) -> Vec<u8> {
    let mut reader = store.get_object_reader(hash).await.expect("tree reader");
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.expect("read tree");
    buf
}

#[tokio::test]
async fn merge_prefers_peers_and_falls_back_to_store() {
    let store = MemObjClient::new();
    let tags = ["job-j1-chunk-s1", "job-j1-chunk-s2", "job-j1-chunk-s3"];
    let trees = [
        chunk_tree("alpha", 4),
        chunk_tree("beta", 4),
        chunk_tree("gamma", 4),
    ];
    for (tag, bytes) in tags.iter().zip(trees.iter()) {
        support::put_tagged(&store, tag, bytes).await;
    }

    // Producer worker serving the first chunk from its per-job cache.
    let producer = scripted_driver(store.clone());
    producer
        .chunk_caches()
        .get_or_create("j1")
        .put(tags[0], trees[0].clone())
        .expect("seed producer cache");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let producer_dyn: Arc<dyn Driver> = producer.clone();
    tokio::spawn(
        Server::builder()
            .add_service(WorkerServer::new(ChunkService::new(producer_dyn)))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    // Consumer: one live peer, one unreachable peer, one store-only chunk.
    let consumer = scripted_driver(store.clone());
    consumer
        .chunk_caches()
        .get_or_create("j1")
        .put("stale-tag", trees[0].clone())
        .expect("seed stale entry");
    let consumer_dyn: Arc<dyn Driver> = consumer.clone();

    let hashtrees = vec![
        HashtreeInfo {
            address: addr.to_string(),
            tag: tags[0].to_string(),
        },
        HashtreeInfo {
            address: "127.0.0.1:1".to_string(),
            tag: tags[1].to_string(),
        },
        HashtreeInfo {
            address: String::new(),
            tag: tags[2].to_string(),
        },
    ];
    let (result, data) =
        support::run_merge_subtask(&consumer_dyn, "j1", "m1", 0, false, hashtrees, None).await;
    result.expect("merge subtask");

    let tree = data.tree.expect("merged tree");
    let stored = read_stored_tree(&store, &tree.hash).await;
    let filter = Filter::new(1, 0).expect("filter");
    let (expected, expected_size) = reference_merge(
        &[trees[0].as_slice(), trees[1].as_slice(), trees[2].as_slice()],
        &filter,
    );
    assert_eq!(stored, expected);
    assert_eq!(data.tree_size, expected_size);

    // All referenced chunks are cached; the stale entry is gone.
    let cache = consumer.chunk_caches().get_or_create("j1");
    assert!(!cache.has("stale-tag"));
    for tag in &tags {
        assert!(cache.has(tag), "missing cached chunk {tag}");
    }

    // The index sidecar landed next to the tree's block.
    let info = store.inspect_object(&tree.hash).await.expect("tree info");
    let sidecar_path = format!("{}{INDEX_PATH}", store.block_path(&info.block_ref));
    assert!(store.direct_entry(&sidecar_path).is_some());
}

#[tokio::test]
async fn peer_served_chunks_stay_raw_across_shard_merges() {
    let store = MemObjClient::new();
    let tag = "job-j4-chunk-s1";
    let tree = chunk_tree("sharded", 32);
    support::put_tagged(&store, tag, &tree).await;

    let producer = Arc::new(
        TestDriver::new(store.clone(), PipelineInfo::default(), user_code(|_, _| Ok(())))
            .with_num_shards(2),
    );
    producer
        .chunk_caches()
        .get_or_create("j4")
        .put(tag, tree.clone())
        .expect("seed producer cache");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let producer_dyn: Arc<dyn Driver> = producer.clone();
    tokio::spawn(
        Server::builder()
            .add_service(WorkerServer::new(ChunkService::new(producer_dyn)))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    let consumer = Arc::new(
        TestDriver::new(store.clone(), PipelineInfo::default(), user_code(|_, _| Ok(())))
            .with_num_shards(2),
    );
    let consumer_dyn: Arc<dyn Driver> = consumer.clone();
    let hashtrees = vec![HashtreeInfo {
        address: addr.to_string(),
        tag: tag.to_string(),
    }];

    // Shard 0 fetches the chunk from the peer and caches it for the job.
    let (result, shard0) =
        support::run_merge_subtask(&consumer_dyn, "j4", "m0", 0, false, hashtrees.clone(), None)
            .await;
    result.expect("shard 0 merge");
    let filter0 = Filter::new(2, 0).expect("filter");
    let (expected0, _) = reference_merge(&[tree.as_slice()], &filter0);
    assert_eq!(
        read_stored_tree(&store, &shard0.tree.expect("shard 0 tree").hash).await,
        expected0
    );
    assert!(consumer.chunk_caches().get_or_create("j4").has(tag));

    // Shard 1 reuses the job-cached chunk without re-fetching; the cached
    // bytes must still be the full tree, not shard 0's slice of it.
    let (result, shard1) =
        support::run_merge_subtask(&consumer_dyn, "j4", "m1", 1, false, hashtrees, None).await;
    result.expect("shard 1 merge");
    let filter1 = Filter::new(2, 1).expect("filter");
    let (expected1, expected_size) = reference_merge(&[tree.as_slice()], &filter1);
    assert_eq!(
        read_stored_tree(&store, &shard1.tree.expect("shard 1 tree").hash).await,
        expected1
    );
    assert_eq!(shard1.tree_size, expected_size);
}

#[tokio::test]
async fn parent_only_merge_equals_filtered_parent() {
    let store = MemObjClient::new();
    let parent_bytes = chunk_tree("parent", 16);
    let (parent_object, _) = store.put_object(&parent_bytes).await.expect("store parent");

    let consumer = Arc::new(
        TestDriver::new(store.clone(), PipelineInfo::default(), user_code(|_, _| Ok(())))
            .with_num_shards(2),
    );
    let consumer_dyn: Arc<dyn Driver> = consumer.clone();

    let (result, data) = support::run_merge_subtask(
        &consumer_dyn,
        "j2",
        "m1",
        1,
        false,
        Vec::new(),
        Some(ObjectRef {
            hash: parent_object.hash,
        }),
    )
    .await;
    result.expect("merge subtask");

    let tree = data.tree.expect("merged tree");
    let stored = read_stored_tree(&store, &tree.hash).await;
    let filter = Filter::new(2, 1).expect("filter");
    let (expected, expected_size) = reference_merge(&[parent_bytes.as_slice()], &filter);
    assert_eq!(stored, expected);
    assert_eq!(data.tree_size, expected_size);
}

#[tokio::test]
async fn stats_merge_uses_stats_chunk_cache() {
    let store = MemObjClient::new();
    let stats_tree = chunk_tree("stats", 3);
    support::put_tagged(&store, "job-j3-chunk-stats-s1", &stats_tree).await;

    let consumer = scripted_driver(store.clone());
    let consumer_dyn: Arc<dyn Driver> = consumer.clone();

    let hashtrees = vec![HashtreeInfo {
        address: String::new(),
        tag: "job-j3-chunk-stats-s1".to_string(),
    }];
    let (result, data) =
        support::run_merge_subtask(&consumer_dyn, "j3", "m1", 0, true, hashtrees, None).await;
    result.expect("stats merge");
    assert!(data.tree.is_some());

    assert!(consumer
        .chunk_stats_caches()
        .get_or_create("j3")
        .has("job-j3-chunk-stats-s1"));
    assert!(!consumer
        .chunk_caches()
        .get_or_create("j3")
        .has("job-j3-chunk-stats-s1"));
}
