//! Test support: a scripted driver and payload builders.
//!
//! Used by this crate's unit tests and the integration scenarios under
//! `tests/`; production code never touches it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dfl_common::{DflError, PipelineInfo, Result};
use dfl_hashtree::Ordered;
use dfl_objstore::{MemObjClient, ObjClient};
use futures::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::driver::{capture_output, stage_inputs, CacheRegistry, Driver, StagedData};
use crate::logs::DatumLogger;
use crate::tags::random_key;
use crate::task::{Commit, DatumInputs, DatumInputsList, File, FileInfo, Input, ObjectRef};

/// Scripted user-code hook: receives the exported env and the active
/// scratch directory (inputs at `<dir>/<name>/<path>`, output at `<dir>/out`).
pub type UserCode =
    Arc<dyn Fn(Vec<(String, String)>, PathBuf) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a synchronous closure as scripted user code.
pub fn user_code<F>(f: F) -> UserCode
where
    F: Fn(Vec<(String, String)>, PathBuf) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |env, dir| {
        let result = f(env, dir);
        Box::pin(async move { result })
    })
}

/// Unique temp path for a test-owned directory.
pub fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}_{nanos}_{}", random_key()))
}

/// Driver whose user code is a closure instead of a child process.
///
/// Staging and output capture go through the same helpers as
/// [`crate::driver::LocalDriver`], so scenarios exercise real trees and a
/// real (in-memory) object store.
pub struct TestDriver {
    objstore: MemObjClient,
    pipeline: PipelineInfo,
    root: PathBuf,
    input_dir: PathBuf,
    num_shards: i64,
    active: Arc<AsyncMutex<()>>,
    active_dir: Mutex<Option<PathBuf>>,
    chunk_caches: CacheRegistry,
    chunk_stats_caches: CacheRegistry,
    user_code: UserCode,
    error_code: Option<UserCode>,
    user_code_runs: AtomicU64,
    error_code_runs: AtomicU64,
}

impl TestDriver {
    /// Build a driver over a shared in-memory store.
    pub fn new(objstore: MemObjClient, pipeline: PipelineInfo, user_code: UserCode) -> Self {
        let root = unique_temp_dir("dfl_test_driver");
        let input_dir = root.join("dfl");
        std::fs::create_dir_all(root.join("scratch")).expect("create scratch dir");
        std::fs::create_dir_all(&input_dir).expect("create input dir");
        Self {
            objstore,
            pipeline,
            root,
            input_dir,
            num_shards: 1,
            active: Arc::new(AsyncMutex::new(())),
            active_dir: Mutex::new(None),
            chunk_caches: CacheRegistry::new(),
            chunk_stats_caches: CacheRegistry::new(),
            user_code,
            error_code: None,
            user_code_runs: AtomicU64::new(0),
            error_code_runs: AtomicU64::new(0),
        }
    }

    /// Script the error handler.
    pub fn with_error_code(mut self, error_code: UserCode) -> Self {
        self.error_code = Some(error_code);
        self
    }

    /// Override the shard count (default 1).
    pub fn with_num_shards(mut self, num_shards: i64) -> Self {
        self.num_shards = num_shards;
        self
    }

    /// Times the transform closure ran.
    pub fn user_code_runs(&self) -> u64 {
        self.user_code_runs.load(Ordering::SeqCst)
    }

    /// Times the error handler closure ran.
    pub fn error_code_runs(&self) -> u64 {
        self.error_code_runs.load(Ordering::SeqCst)
    }

    /// Shared handle to the backing store.
    pub fn objstore_handle(&self) -> MemObjClient {
        self.objstore.clone()
    }
}

#[async_trait]
impl Driver for TestDriver {
    fn objstore(&self) -> Arc<dyn ObjClient> {
        Arc::new(self.objstore.clone())
    }

    fn pipeline(&self) -> &PipelineInfo {
        &self.pipeline
    }

    fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    fn num_shards(&self) -> i64 {
        self.num_shards
    }

    fn chunk_caches(&self) -> &CacheRegistry {
        &self.chunk_caches
    }

    fn chunk_stats_caches(&self) -> &CacheRegistry {
        &self.chunk_stats_caches
    }

    async fn download_data(
        &self,
        inputs: &[Input],
        input_tree: Option<&mut Ordered>,
    ) -> Result<StagedData> {
        stage_inputs(&self.objstore, inputs, &self.root.join("scratch"), input_tree).await
    }

    async fn acquire_workspace(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.active).lock_owned().await
    }

    fn link_data(&self, _inputs: &[Input], dir: &Path) -> Result<()> {
        *self.active_dir.lock().unwrap_or_else(|e| e.into_inner()) = Some(dir.to_path_buf());
        Ok(())
    }

    fn unlink_data(&self) -> Result<()> {
        *self.active_dir.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn run_user_code(
        &self,
        env: &[(String, String)],
        _timeout: Option<Duration>,
        token: &CancellationToken,
        logs: &DatumLogger,
    ) -> Result<()> {
        self.user_code_runs.fetch_add(1, Ordering::SeqCst);
        if token.is_cancelled() {
            return Err(DflError::Execution("user code canceled".to_string()));
        }
        let dir = self
            .active_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| DflError::Execution("no active datum directory".to_string()))?;
        let result = (self.user_code)(env.to_vec(), dir).await;
        if let Err(err) = &result {
            logs.write_line(&format!("user code error: {err}"));
        }
        result
    }

    async fn run_user_error_handling_code(
        &self,
        env: &[(String, String)],
        _timeout: Option<Duration>,
        token: &CancellationToken,
        logs: &DatumLogger,
    ) -> Result<()> {
        self.error_code_runs.fetch_add(1, Ordering::SeqCst);
        if token.is_cancelled() {
            return Err(DflError::Execution("error handler canceled".to_string()));
        }
        let error_code = self
            .error_code
            .as_ref()
            .ok_or_else(|| DflError::InvalidConfig("no error handler configured".to_string()))?;
        let dir = self
            .active_dir
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| DflError::Execution("no active datum directory".to_string()))?;
        let result = (error_code)(env.to_vec(), dir).await;
        if let Err(err) = &result {
            logs.write_line(&format!("error handler error: {err}"));
        }
        result
    }

    async fn upload_output(
        &self,
        dir: &Path,
        tag: &str,
        output_tree: Option<&mut Ordered>,
    ) -> Result<(Vec<u8>, u64)> {
        capture_output(&self.objstore, dir, tag, output_tree).await
    }
}

impl Drop for TestDriver {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Store `contents` as an object and return an input referencing it.
pub async fn make_input(objstore: &MemObjClient, name: &str, path: &str, contents: &[u8]) -> Input {
    let (object, size) = objstore.put_object(contents).await.expect("put input object");
    Input {
        name: name.to_string(),
        file_info: FileInfo {
            file: File {
                commit: Commit {
                    id: format!("{name}-commit"),
                },
                path: path.to_string(),
            },
            hash: object.hash,
            size_bytes: size,
        },
    }
}

/// Store a datum list object and return its handle.
pub async fn store_datum_list(objstore: &MemObjClient, datums: Vec<DatumInputs>) -> ObjectRef {
    let list = DatumInputsList { datums };
    let bytes = serde_json::to_vec(&list).expect("encode datum list");
    let (object, _) = objstore.put_object(&bytes).await.expect("put datum list");
    ObjectRef { hash: object.hash }
}
