#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use dfl_common::Result;
use dfl_objstore::{MemObjClient, ObjClient};
use dfl_worker::{
    deserialize_datum_data, deserialize_merge_data, handle_subtask, serialize_datum_data,
    serialize_merge_data, Commit, DatumData, Driver, HashtreeInfo, MergeData, ObjectRef, Status,
    Subtask,
};

/// Route test logs through tracing when `RUST_LOG` asks for them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Run one datum subtask through the dispatcher and decode the mutated
/// payload.
pub async fn run_datum_subtask(
    driver: &Arc<dyn Driver>,
    job_id: &str,
    subtask_id: &str,
    datums: ObjectRef,
) -> (Result<()>, DatumData) {
    init_tracing();
    let data = DatumData {
        job_id: job_id.to_string(),
        datums,
        output_commit: Commit {
            id: "out-commit".to_string(),
        },
        stats: None,
        chunk_hashtree: None,
        recovered_datums_tag: None,
        stats_hashtree: None,
    };
    let mut subtask = Subtask {
        id: subtask_id.to_string(),
        payload: serialize_datum_data(&data).expect("encode datum payload"),
    };
    let status = Arc::new(Status::new());
    let result = handle_subtask(driver, &status, &mut subtask).await;
    let data = deserialize_datum_data(&subtask.payload).expect("decode datum payload");
    (result, data)
}

/// Run one merge subtask through the dispatcher and decode the mutated
/// payload.
pub async fn run_merge_subtask(
    driver: &Arc<dyn Driver>,
    job_id: &str,
    subtask_id: &str,
    shard: i64,
    stats: bool,
    hashtrees: Vec<HashtreeInfo>,
    parent: Option<ObjectRef>,
) -> (Result<()>, MergeData) {
    init_tracing();
    let data = MergeData {
        job_id: job_id.to_string(),
        shard,
        stats,
        hashtrees,
        parent,
        tree: None,
        tree_size: 0,
    };
    let mut subtask = Subtask {
        id: subtask_id.to_string(),
        payload: serialize_merge_data(&data).expect("encode merge payload"),
    };
    let status = Arc::new(Status::new());
    let result = handle_subtask(driver, &status, &mut subtask).await;
    let data = deserialize_merge_data(&subtask.payload).expect("decode merge payload");
    (result, data)
}

/// Store `bytes` in the object store under `tag`.
pub async fn put_tagged(store: &MemObjClient, tag: &str, bytes: &[u8]) {
    let mut writer = store
        .put_object_async(vec![tag.to_string()])
        .await
        .expect("tag writer");
    writer.write_all(bytes).expect("write tagged bytes");
    writer.close().expect("close tag writer");
}
