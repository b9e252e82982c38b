//! The seam between the worker core and its environment: input staging,
//! workspace activation, user-code execution, output capture, and the
//! per-job chunk cache registries.
//!
//! [`LocalDriver`] is the production implementation; tests script user code
//! through [`crate::testing::TestDriver`] instead of spawning processes.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dfl_common::{DflError, PipelineInfo, Result};
use dfl_hashtree::{MergeCache, Ordered};
use dfl_objstore::ObjClient;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::logs::DatumLogger;
use crate::tags::random_key;
use crate::task::Input;

/// Keyed registry of per-job merge caches.
///
/// Caches are created lazily per job id and live until the job ends; they
/// back both peer chunk serving and merge-task reuse.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<String, Arc<MergeCache>>>,
}

impl CacheRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<MergeCache>>> {
        self.caches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The job's cache, created on first use.
    pub fn get_or_create(&self, job_id: &str) -> Arc<MergeCache> {
        Arc::clone(
            self.lock()
                .entry(job_id.to_string())
                .or_insert_with(|| Arc::new(MergeCache::new())),
        )
    }

    /// Drop the job's cache at the job-end boundary.
    pub fn remove(&self, job_id: &str) {
        self.lock().remove(job_id);
    }
}

/// Inputs staged on local disk for one datum attempt.
///
/// The directory (including any user output written under `out/`) is removed
/// when the value drops, so staging is released on every exit path.
pub struct StagedData {
    dir: PathBuf,
    download_bytes: u64,
}

impl StagedData {
    /// The staged directory; inputs live under `<dir>/<name>/<path>` and
    /// user output is captured from `<dir>/out`.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes fetched from the object store while staging.
    pub fn download_bytes(&self) -> u64 {
        self.download_bytes
    }
}

impl Drop for StagedData {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Environment and lifecycle operations the datum pipeline composes.
///
/// The closure-scoped acquisitions of the original design are expressed as
/// leaf operations plus RAII values ([`StagedData`], the workspace guard),
/// so release on cancellation comes for free.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Object store client shared by every operation of this worker.
    fn objstore(&self) -> Arc<dyn ObjClient>;

    /// Pipeline identity and execution policy.
    fn pipeline(&self) -> &PipelineInfo;

    /// Directory where user code finds its inputs.
    fn input_dir(&self) -> &Path;

    /// Number of shards the final output tree is split into.
    fn num_shards(&self) -> i64;

    /// Per-job output chunk caches served to peer workers.
    fn chunk_caches(&self) -> &CacheRegistry;

    /// Per-job stats chunk caches served to peer workers.
    fn chunk_stats_caches(&self) -> &CacheRegistry;

    /// Stage a datum's inputs into a fresh scratch directory, filling
    /// `input_tree` when stats are enabled.
    async fn download_data(
        &self,
        inputs: &[Input],
        input_tree: Option<&mut Ordered>,
    ) -> Result<StagedData>;

    /// Serialize access to the shared workspace: exactly one datum may be
    /// active even while many stage inputs concurrently.
    async fn acquire_workspace(&self) -> OwnedMutexGuard<()>;

    /// Expose the staged directory under the canonical input dir. Only valid
    /// while holding the workspace guard.
    fn link_data(&self, inputs: &[Input], dir: &Path) -> Result<()>;

    /// Remove whatever [`Driver::link_data`] exposed.
    fn unlink_data(&self) -> Result<()>;

    /// Run the transform once; captured output is appended to `logs`.
    async fn run_user_code(
        &self,
        env: &[(String, String)],
        timeout: Option<Duration>,
        token: &CancellationToken,
        logs: &DatumLogger,
    ) -> Result<()>;

    /// Run the error handler once, on the final retry of a failing datum.
    async fn run_user_error_handling_code(
        &self,
        env: &[(String, String)],
        timeout: Option<Duration>,
        token: &CancellationToken,
        logs: &DatumLogger,
    ) -> Result<()>;

    /// Capture `<dir>/out` into a serialized tree, uploading file contents;
    /// returns the tree bytes and the uploaded byte count.
    async fn upload_output(
        &self,
        dir: &Path,
        tag: &str,
        output_tree: Option<&mut Ordered>,
    ) -> Result<(Vec<u8>, u64)>;
}

/// Stage `inputs` from the object store under a fresh directory in `root`.
///
/// Layout: `<root>/<key>/<input name>/<file path>`, plus an empty `out/`
/// directory for user code to write into.
pub async fn stage_inputs(
    objstore: &dyn ObjClient,
    inputs: &[Input],
    root: &Path,
    mut input_tree: Option<&mut Ordered>,
) -> Result<StagedData> {
    let dir = root.join(random_key());
    tokio::fs::create_dir_all(dir.join("out")).await?;
    let mut staged = StagedData {
        dir,
        download_bytes: 0,
    };

    for input in inputs {
        let dest = staged
            .dir
            .join(&input.name)
            .join(&input.file_info.file.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut reader = objstore.get_object_reader(&input.file_info.hash).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        tokio::fs::write(&dest, &buf).await?;
        staged.download_bytes += buf.len() as u64;
        if let Some(tree) = input_tree.as_mut() {
            tree.put_file(
                &format!("{}/{}", input.name, input.file_info.file.path),
                &input.file_info.hash,
                buf.len() as u64,
                None,
            );
        }
    }

    Ok(staged)
}

/// Capture `<dir>/out` into a serialized tree rooted at `/`, uploading every
/// file as a content-addressed object and the tree itself under `tag`.
///
/// The tagged tree is what later runs find during the datum cache probe.
pub async fn capture_output(
    objstore: &dyn ObjClient,
    dir: &Path,
    tag: &str,
    mut output_tree: Option<&mut Ordered>,
) -> Result<(Vec<u8>, u64)> {
    let out_dir = dir.join("out");
    let mut files = Vec::new();
    collect_files(&out_dir, &out_dir, &mut files)?;
    files.sort();

    let mut tree = Ordered::new("/");
    let mut uploaded = 0u64;
    for rel in &files {
        let bytes = tokio::fs::read(out_dir.join(rel)).await?;
        let (object, size) = objstore.put_object(&bytes).await?;
        let info = objstore.inspect_object(&object.hash).await?;
        tree.put_file(rel, &object.hash, size, Some(info.block_ref.clone()));
        if let Some(out_tree) = output_tree.as_mut() {
            out_tree.put_file(rel, &object.hash, size, Some(info.block_ref));
        }
        uploaded += size;
    }

    let tree_bytes = tree.serialize_to_vec()?;
    let mut writer = objstore.put_object_async(vec![tag.to_string()]).await?;
    writer.write_all(&tree_bytes)?;
    writer.close()?;
    Ok((tree_bytes, uploaded))
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(base, &path, out)?;
        } else {
            let rel = path.strip_prefix(base).map_err(|e| {
                DflError::Execution(format!("output path escaped capture root: {e}"))
            })?;
            out.push(rel.to_string_lossy().into_owned());
        }
    }
    Ok(())
}

/// Production driver: stages inputs on local disk, runs the transform as a
/// child process inside the shared workspace, and captures `out/` into the
/// object store.
pub struct LocalDriver {
    objstore: Arc<dyn ObjClient>,
    pipeline: PipelineInfo,
    scratch_dir: PathBuf,
    input_dir: PathBuf,
    num_shards: i64,
    active: Arc<AsyncMutex<()>>,
    chunk_caches: CacheRegistry,
    chunk_stats_caches: CacheRegistry,
}

impl LocalDriver {
    /// Build a driver rooted at `root` (scratch staging plus the canonical
    /// input dir both live under it).
    pub fn new(
        objstore: Arc<dyn ObjClient>,
        pipeline: PipelineInfo,
        root: impl Into<PathBuf>,
        num_shards: i64,
    ) -> Result<Self> {
        if num_shards <= 0 {
            return Err(DflError::InvalidConfig(format!(
                "shard count must be positive, got {num_shards}"
            )));
        }
        let root = root.into();
        let scratch_dir = root.join("scratch");
        let input_dir = root.join("dfl");
        std::fs::create_dir_all(&scratch_dir)?;
        std::fs::create_dir_all(&input_dir)?;
        Ok(Self {
            objstore,
            pipeline,
            scratch_dir,
            input_dir,
            num_shards,
            active: Arc::new(AsyncMutex::new(())),
            chunk_caches: CacheRegistry::new(),
            chunk_stats_caches: CacheRegistry::new(),
        })
    }

    async fn run_command(
        &self,
        cmd: &[String],
        env: &[(String, String)],
        timeout: Option<Duration>,
        token: &CancellationToken,
        logs: &DatumLogger,
    ) -> Result<()> {
        let program = cmd
            .first()
            .ok_or_else(|| DflError::InvalidConfig("empty user command".to_string()))?;
        let mut command = Command::new(program);
        command
            .args(&cmd[1..])
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.input_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| DflError::Execution(format!("failed to spawn user code: {e}")))?;
        let wait = child.wait_with_output();

        // Dropping the wait future kills the child via kill_on_drop.
        let output = if let Some(limit) = timeout {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(DflError::Execution("user code canceled".to_string()));
                }
                waited = tokio::time::timeout(limit, wait) => match waited {
                    Ok(result) => result
                        .map_err(|e| DflError::Execution(format!("user code wait failed: {e}")))?,
                    Err(_) => {
                        return Err(DflError::Execution(format!(
                            "user code timed out after {limit:?}"
                        )));
                    }
                },
            }
        } else {
            tokio::select! {
                _ = token.cancelled() => {
                    return Err(DflError::Execution("user code canceled".to_string()));
                }
                result = wait => result
                    .map_err(|e| DflError::Execution(format!("user code wait failed: {e}")))?,
            }
        };

        logs.write(&output.stdout);
        logs.write(&output.stderr);
        if !output.status.success() {
            return Err(DflError::Execution(format!(
                "user code exited with {}",
                output.status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for LocalDriver {
    fn objstore(&self) -> Arc<dyn ObjClient> {
        Arc::clone(&self.objstore)
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
        stage_inputs(self.objstore.as_ref(), inputs, &self.scratch_dir, input_tree).await
    }

    async fn acquire_workspace(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.active).lock_owned().await
    }

    fn link_data(&self, _inputs: &[Input], dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            std::os::unix::fs::symlink(entry.path(), self.input_dir.join(entry.file_name()))?;
        }
        Ok(())
    }

    fn unlink_data(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.input_dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    async fn run_user_code(
        &self,
        env: &[(String, String)],
        timeout: Option<Duration>,
        token: &CancellationToken,
        logs: &DatumLogger,
    ) -> Result<()> {
        let cmd = self.pipeline.cmd.clone();
        self.run_command(&cmd, env, timeout, token, logs).await
    }

    async fn run_user_error_handling_code(
        &self,
        env: &[(String, String)],
        timeout: Option<Duration>,
        token: &CancellationToken,
        logs: &DatumLogger,
    ) -> Result<()> {
        let cmd = self
            .pipeline
            .err_cmd
            .clone()
            .ok_or_else(|| DflError::InvalidConfig("no error handler configured".to_string()))?;
        self.run_command(&cmd, env, timeout, token, logs).await
    }

    async fn upload_output(
        &self,
        dir: &Path,
        tag: &str,
        output_tree: Option<&mut Ordered>,
    ) -> Result<(Vec<u8>, u64)> {
        debug!(tag, dir = %dir.display(), "capturing user output");
        capture_output(self.objstore.as_ref(), dir, tag, output_tree).await
    }
}
