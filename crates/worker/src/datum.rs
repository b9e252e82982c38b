//! The datum pipeline: bounded fan-out over a subtask's datums, per-datum
//! cache probe / retry / recovery, stats capture, and chunk publication.
//!
//! Concurrency shape:
//! - a semaphore bounds in-flight datums to the pipeline's `max_queue_size`;
//! - tasks run in a join set tied to a cancellation token, so the first
//!   infrastructure error cancels the remaining siblings;
//! - sub-stats merge under one async mutex even when a datum errored, so
//!   partial download/process/upload timings are never lost.
//!
//! Outcome accounting per datum:
//! - cache hit: `datums_skipped`, no user code runs;
//! - user code succeeded (possibly after retries): `datums_processed`;
//! - error handler rescued the final retry: `datums_recovered`, and the
//!   datum's content hash joins the recovered list;
//! - retries exhausted: `datums_failed` plus a sticky `failed_datum_id`;
//!   the subtask then publishes no output chunk.

use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use dfl_common::{
    sidecar_s3_gateway_service, DflError, PipelineInfo, Result, JOB_ID_ENV, OUTPUT_COMMIT_ID_ENV,
    S3_GATEWAY_PORT_ENV, WORKER_IP_ENV,
};
use dfl_hashtree::{merge as merge_trees, MergeCache, Ordered, Reader, Unordered, Writer};
use dfl_objstore::ObjClient;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::logs::DatumLogger;
use crate::s3gateway::check_s3_gateway;
use crate::stats::{merge_stats, DatumStats, ProcessStats};
use crate::status::Status;
use crate::tags::{
    datum_id as datum_id_of, hash_datum, job_chunk_stats_tag, job_chunk_tag,
    job_recovered_datums_tag, random_key, stats_tag,
};
use crate::task::{Commit, DatumData, DatumInputsList, HashtreeInfo, Input, ObjectRef, RecoveredDatums};

struct Accum {
    stats: DatumStats,
    recovered: Vec<String>,
}

enum UserOutcome {
    Processed,
    Recovered,
}

/// Handle one datum-batch subtask end to end.
pub async fn handle_datum_task(
    driver: &Arc<dyn Driver>,
    status: &Arc<Status>,
    data: &mut DatumData,
    subtask_id: &str,
) -> Result<()> {
    if driver.pipeline().uses_s3_gateway() {
        check_s3_gateway(&data.job_id).await?;
    }

    // Subtask-scoped caches; owned here so they release on every exit path.
    let datum_cache = Arc::new(MergeCache::new());
    let stats_cache = Arc::new(MergeCache::new());

    data.stats = Some(DatumStats::default());
    let accum = Arc::new(Mutex::new(Accum {
        stats: DatumStats::default(),
        recovered: Vec::new(),
    }));
    let queue_size = Arc::new(AtomicI64::new(0));

    info!(job_id = %data.job_id, subtask_id, "processing datums");
    status
        .with_stats(
            Arc::clone(&queue_size),
            process_datums(
                driver,
                status,
                &data.job_id,
                &data.datums,
                &data.output_commit,
                &datum_cache,
                &stats_cache,
                &accum,
                &queue_size,
            ),
        )
        .await?;

    let accum = Arc::try_unwrap(accum)
        .map_err(|_| DflError::Execution("datum accumulator still shared".to_string()))?
        .into_inner();
    let Accum { stats, recovered } = accum;

    let worker_address = std::env::var(WORKER_IP_ENV).unwrap_or_default();
    if stats.datums_failed == 0 && !driver.pipeline().s3_out {
        if !recovered.is_empty() {
            let recovered_tag = job_recovered_datums_tag(&data.job_id, subtask_id);
            upload_recovered_datums(driver.as_ref(), &recovered, &recovered_tag).await?;
            data.recovered_datums_tag = Some(recovered_tag);
        }

        let chunk_cache = driver.chunk_caches().get_or_create(&data.job_id);
        let chunk_tag = job_chunk_tag(&data.job_id, subtask_id);
        upload_chunk(driver.as_ref(), &datum_cache, &chunk_cache, &chunk_tag).await?;
        data.chunk_hashtree = Some(HashtreeInfo {
            address: worker_address.clone(),
            tag: chunk_tag,
        });
    }

    if driver.pipeline().enable_stats {
        let chunk_stats_cache = driver.chunk_stats_caches().get_or_create(&data.job_id);
        let chunk_stats_tag = job_chunk_stats_tag(&data.job_id, subtask_id);
        upload_chunk(driver.as_ref(), &stats_cache, &chunk_stats_cache, &chunk_stats_tag).await?;
        data.stats_hashtree = Some(HashtreeInfo {
            address: worker_address,
            tag: chunk_stats_tag,
        });
    }

    data.stats = Some(stats);
    Ok(())
}

async fn process_datums(
    driver: &Arc<dyn Driver>,
    status: &Arc<Status>,
    job_id: &str,
    datums: &ObjectRef,
    output_commit: &Commit,
    datum_cache: &Arc<MergeCache>,
    stats_cache: &Arc<MergeCache>,
    accum: &Arc<Mutex<Accum>>,
    queue_size: &Arc<AtomicI64>,
) -> Result<()> {
    let limiter = Arc::new(Semaphore::new(driver.pipeline().max_queue_size.max(1)));
    let token = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let spawn_result: Result<()> = async {
        let list = read_datum_list(driver.as_ref(), datums).await?;
        for datum in list.datums {
            let permit = Arc::clone(&limiter)
                .acquire_owned()
                .await
                .map_err(|e| DflError::Execution(format!("datum gate closed: {e}")))?;
            queue_size.fetch_add(1, AtomicOrdering::SeqCst);

            let driver = Arc::clone(driver);
            let status = Arc::clone(status);
            let datum_cache = Arc::clone(datum_cache);
            let stats_cache = Arc::clone(stats_cache);
            let accum = Arc::clone(accum);
            let queue_size = Arc::clone(queue_size);
            let token = token.clone();
            let job_id = job_id.to_string();
            let output_commit = output_commit.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let (sub_stats, sub_recovered, outcome) = process_datum(
                    &driver,
                    &status,
                    &job_id,
                    datum.index,
                    &datum.inputs,
                    &output_commit,
                    &datum_cache,
                    &stats_cache,
                    &token,
                )
                .await;
                queue_size.fetch_sub(1, AtomicOrdering::SeqCst);

                // Sub-stats are valid even when the datum errored.
                let mut accum = accum.lock().await;
                merge_stats(&mut accum.stats, &sub_stats);
                accum.recovered.extend(sub_recovered);
                outcome
            });
        }
        Ok(())
    }
    .await;

    if let Err(err) = spawn_result {
        token.cancel();
        while tasks.join_next().await.is_some() {}
        return Err(err);
    }

    let mut first_err: Option<DflError> = None;
    while let Some(joined) = tasks.join_next().await {
        let failed = match joined {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(err) => Some(DflError::Execution(format!("datum task join error: {err}"))),
        };
        if let Some(err) = failed {
            if first_err.is_none() {
                token.cancel();
                first_err = Some(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Process one datum. Returned stats and recovered tags are valid even when
/// the result is an error, so the caller merges them unconditionally.
async fn process_datum(
    driver: &Arc<dyn Driver>,
    status: &Arc<Status>,
    job_id: &str,
    datum_index: i64,
    inputs: &[Input],
    output_commit: &Commit,
    datum_cache: &MergeCache,
    stats_cache: &MergeCache,
    token: &CancellationToken,
) -> (DatumStats, Vec<String>, Result<()>) {
    let mut stats = DatumStats::default();
    let mut recovered = Vec::new();
    let result = process_datum_inner(
        driver,
        status,
        job_id,
        datum_index,
        inputs,
        output_commit,
        datum_cache,
        stats_cache,
        token,
        &mut stats,
        &mut recovered,
    )
    .await;
    (stats, recovered, result)
}

async fn process_datum_inner(
    driver: &Arc<dyn Driver>,
    status: &Arc<Status>,
    job_id: &str,
    datum_index: i64,
    inputs: &[Input],
    output_commit: &Commit,
    datum_cache: &MergeCache,
    stats_cache: &MergeCache,
    token: &CancellationToken,
    stats: &mut DatumStats,
    recovered: &mut Vec<String>,
) -> Result<()> {
    let pipeline = driver.pipeline().clone();
    let tag = hash_datum(&pipeline.pipeline_name, &pipeline.salt, inputs);
    let datum_id = datum_id_of(inputs);
    let objstore = driver.objstore();

    // Cache probe: a prior run already produced this datum's output.
    if objstore.inspect_tag(&tag).await? {
        let buf = objstore.get_tag(&tag).await?;
        datum_cache.put(random_key(), buf)?;
        if pipeline.enable_stats {
            match objstore.get_tag(&stats_tag(&tag)).await {
                Ok(stats_buf) => stats_cache.put(random_key(), stats_buf)?,
                // A missing stats tree is fine; it happens when stats were
                // enabled after this datum was first processed.
                Err(err) => debug!(%tag, error = %err, "no stats tree for cached datum"),
            }
        }
        stats.datums_skipped += 1;
        debug!(%datum_id, "datum skipped via cache");
        return Ok(());
    }

    let stats_root = format!("/{datum_id}");
    let mut input_tree = pipeline
        .enable_stats
        .then(|| Ordered::new(format!("{stats_root}/pfs")));
    let mut output_tree = pipeline
        .enable_stats
        .then(|| Ordered::new(format!("{stats_root}/pfs/out")));
    let mut stats_tree = pipeline
        .enable_stats
        .then(|| Unordered::new(stats_root.clone()));
    let logger = DatumLogger::new();
    if let Some(tree) = stats_tree.as_mut() {
        tree.put_file(&format!("job:{job_id}"), "", 0, None);
        let (object, size) = objstore
            .put_object(datum_index.to_string().as_bytes())
            .await?;
        let object_info = objstore.inspect_object(&object.hash).await?;
        tree.put_file("index", &object.hash, size, Some(object_info.block_ref));
    }

    // Zero-delay retry loop; the error handler may turn the final failure
    // into a recovered datum.
    let mut failures: u64 = 0;
    let outcome: Result<UserOutcome> = loop {
        if token.is_cancelled() {
            break Err(DflError::Execution("datum processing canceled".to_string()));
        }
        match attempt_datum(
            driver,
            status,
            job_id,
            &datum_id,
            inputs,
            output_commit,
            &pipeline,
            &tag,
            datum_cache,
            input_tree.as_mut(),
            output_tree.as_mut(),
            &mut stats.process_stats,
            failures,
            token,
            &logger,
        )
        .await
        {
            Ok(outcome) => break Ok(outcome),
            Err(err) => {
                failures += 1;
                if failures >= pipeline.datum_tries.max(1) {
                    warn!(%datum_id, error = %err, "failed to process datum");
                    logger.write_line(&format!("failed to process datum: {err}"));
                    if let Some(tree) = stats_tree.as_mut() {
                        match objstore.put_object(err.to_string().as_bytes()).await {
                            Ok((object, size)) => {
                                match objstore.inspect_object(&object.hash).await {
                                    Ok(info) => tree.put_file(
                                        "failure",
                                        &object.hash,
                                        size,
                                        Some(info.block_ref),
                                    ),
                                    Err(inspect_err) => break Err(inspect_err),
                                }
                            }
                            Err(put_err) => {
                                warn!(error = %put_err, "could not store datum failure object");
                            }
                        }
                    }
                    break Err(err);
                }
                warn!(%datum_id, error = %err, attempt = failures, "failed processing datum, retrying");
                logger.write_line(&format!("failed processing datum: {err}, retrying"));
                if pipeline.enable_stats {
                    input_tree = Some(Ordered::new(format!("{stats_root}/pfs")));
                    output_tree = Some(Ordered::new(format!("{stats_root}/pfs/out")));
                }
            }
        }
    };

    match outcome {
        Ok(UserOutcome::Recovered) => {
            recovered.push(tag.clone());
            stats.datums_recovered += 1;
        }
        Ok(UserOutcome::Processed) => {
            stats.datums_processed += 1;
        }
        Err(_) => {
            stats.failed_datum_id = datum_id.clone();
            stats.datums_failed += 1;
        }
    }

    // The stats tree is written regardless of outcome so partial timings and
    // the failure entry are captured.
    if let (Some(input_tree), Some(output_tree), Some(stats_tree)) =
        (input_tree.take(), output_tree.take(), stats_tree.take())
    {
        debug!(%datum_id, "writing datum stats tree");
        write_stats(
            objstore.as_ref(),
            &stats.process_stats,
            input_tree,
            output_tree,
            stats_tree,
            &tag,
            stats_cache,
            &logger,
        )
        .await?;
    }
    Ok(())
}

async fn attempt_datum(
    driver: &Arc<dyn Driver>,
    status: &Arc<Status>,
    job_id: &str,
    datum_id: &str,
    inputs: &[Input],
    output_commit: &Commit,
    pipeline: &PipelineInfo,
    tag: &str,
    datum_cache: &MergeCache,
    mut input_tree: Option<&mut Ordered>,
    mut output_tree: Option<&mut Ordered>,
    proc_stats: &mut ProcessStats,
    failures: u64,
    token: &CancellationToken,
    logger: &DatumLogger,
) -> Result<UserOutcome> {
    let download_started = Instant::now();
    let staged = driver
        .download_data(inputs, input_tree.as_deref_mut())
        .await?;
    proc_stats.download_time += download_started.elapsed();
    proc_stats.download_bytes += staged.download_bytes();

    // Only one datum may be active in the shared workspace at a time.
    let workspace = driver.acquire_workspace().await;
    let run_result = match driver.link_data(inputs, staged.dir()) {
        Ok(()) => {
            let env = user_code_env(driver.as_ref(), job_id, output_commit, inputs);
            let datum_token = token.child_token();
            let process_started = Instant::now();
            let result = status
                .with_datum(
                    datum_id,
                    datum_token.clone(),
                    run_user(driver.as_ref(), &env, pipeline, failures, &datum_token, logger),
                )
                .await;
            proc_stats.process_time += process_started.elapsed();
            result
        }
        Err(err) => Err(err),
    };
    let unlink_result = driver.unlink_data();
    drop(workspace);

    let outcome = run_result?;
    unlink_result?;
    if matches!(outcome, UserOutcome::Recovered) {
        return Ok(UserOutcome::Recovered);
    }
    if pipeline.s3_out {
        // S3Out pipelines write through the gateway; no worker tree exists.
        return Ok(UserOutcome::Processed);
    }

    let upload_started = Instant::now();
    let (tree_bytes, uploaded) = driver
        .upload_output(staged.dir(), tag, output_tree.as_deref_mut())
        .await?;
    proc_stats.upload_time += upload_started.elapsed();
    proc_stats.upload_bytes += uploaded;
    datum_cache.put(random_key(), tree_bytes)?;
    Ok(UserOutcome::Processed)
}

async fn run_user(
    driver: &dyn Driver,
    env: &[(String, String)],
    pipeline: &PipelineInfo,
    failures: u64,
    token: &CancellationToken,
    logger: &DatumLogger,
) -> Result<UserOutcome> {
    match driver
        .run_user_code(env, pipeline.datum_timeout, token, logger)
        .await
    {
        Ok(()) => Ok(UserOutcome::Processed),
        Err(user_err) => {
            if pipeline.err_cmd.is_some() && failures == pipeline.datum_tries.saturating_sub(1) {
                driver
                    .run_user_error_handling_code(env, pipeline.datum_timeout, token, logger)
                    .await
                    .map_err(|e| {
                        DflError::Execution(format!("user error handling code: {e}"))
                    })?;
                Ok(UserOutcome::Recovered)
            } else {
                Err(user_err)
            }
        }
    }
}

/// Environment exported to user code: the inherited environment plus one
/// path and one commit entry per input, job/commit ids, and the gateway
/// endpoint for S3-enabled pipelines.
pub fn user_code_env(
    driver: &dyn Driver,
    job_id: &str,
    output_commit: &Commit,
    inputs: &[Input],
) -> Vec<(String, String)> {
    let pipeline = driver.pipeline();
    let mut env: Vec<(String, String)> = std::env::vars().collect();
    for input in inputs {
        let path = driver
            .input_dir()
            .join(&input.name)
            .join(&input.file_info.file.path);
        env.push((input.name.clone(), path.to_string_lossy().into_owned()));
        env.push((
            format!("{}_COMMIT", input.name),
            input.file_info.file.commit.id.clone(),
        ));
    }
    env.push((JOB_ID_ENV.to_string(), job_id.to_string()));
    env.push((OUTPUT_COMMIT_ID_ENV.to_string(), output_commit.id.clone()));
    if pipeline.uses_s3_gateway() {
        env.push((
            "S3_ENDPOINT".to_string(),
            format!(
                "http://{}.{}:{}",
                sidecar_s3_gateway_service(job_id),
                pipeline.namespace,
                std::env::var(S3_GATEWAY_PORT_ENV).unwrap_or_default(),
            ),
        ));
    }
    env
}

/// Write one datum's stats tree: the input tree, output tree, and ordered
/// stats tree merge into a single buffer even when some are empty, so
/// downstream consumers see a uniform shape.
async fn write_stats(
    objstore: &dyn ObjClient,
    proc_stats: &ProcessStats,
    input_tree: Ordered,
    output_tree: Ordered,
    mut stats_tree: Unordered,
    tag: &str,
    stats_cache: &MergeCache,
    logger: &DatumLogger,
) -> Result<()> {
    let stats_json = serde_json::to_vec(proc_stats)
        .map_err(|e| DflError::Execution(format!("could not serialize stats: {e}")))?;
    let (object, size) = objstore.put_object(&stats_json).await?;
    let info = objstore.inspect_object(&object.hash).await?;
    stats_tree.put_file("stats", &object.hash, size, Some(info.block_ref));

    if let Some(log_bytes) = logger.take() {
        let (object, size) = objstore.put_object(&log_bytes).await?;
        let info = objstore.inspect_object(&object.hash).await?;
        stats_tree.put_file("logs", &object.hash, size, Some(info.block_ref));
    }

    let input_buf = input_tree.serialize_to_vec()?;
    let output_buf = output_tree.serialize_to_vec()?;
    let stats_buf = stats_tree.ordered().serialize_to_vec()?;
    let mut merged = Vec::new();
    {
        let mut writer = Writer::new(&mut merged)?;
        merge_trees(
            &mut writer,
            vec![
                Reader::new(Cursor::new(&input_buf), None)?,
                Reader::new(Cursor::new(&output_buf), None)?,
                Reader::new(Cursor::new(&stats_buf), None)?,
            ],
        )?;
    }

    let mut obj_writer = objstore.put_object_async(vec![stats_tag(tag)]).await?;
    obj_writer.write_all(&merged)?;
    obj_writer.close()?;
    stats_cache.put(tag, merged)?;
    Ok(())
}

async fn read_datum_list(driver: &dyn Driver, datums: &ObjectRef) -> Result<DatumInputsList> {
    let mut reader = driver.objstore().get_object_reader(&datums.hash).await?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    serde_json::from_slice(&buf)
        .map_err(|e| DflError::Execution(format!("datum list decode failed: {e}")))
}

async fn upload_recovered_datums(
    driver: &dyn Driver,
    recovered: &[String],
    tag: &str,
) -> Result<()> {
    info!(tag, count = recovered.len(), "uploading recovered datums");
    let message = RecoveredDatums {
        hashes: recovered.to_vec(),
    };
    let buf = serde_json::to_vec(&message)
        .map_err(|e| DflError::Execution(format!("recovered datums encode failed: {e}")))?;
    let mut writer = driver.objstore().put_object_async(vec![tag.to_string()]).await?;
    writer.write_all(&buf)?;
    writer.close()?;
    Ok(())
}

/// Merge every entry of `subtask_cache` into one chunk, register it in the
/// per-job `chunk_cache` for peer serving, and upload it under `tag`.
///
/// After this returns the chunk is reachable both as `{address: self, tag}`
/// and by tag alone through the object store.
pub(crate) async fn upload_chunk(
    driver: &dyn Driver,
    subtask_cache: &MergeCache,
    chunk_cache: &MergeCache,
    tag: &str,
) -> Result<()> {
    let mut buf = Vec::new();
    {
        let mut writer = Writer::new(&mut buf)?;
        subtask_cache.merge(&mut writer, None, None)?;
    }
    info!(tag, len = buf.len(), "merged hashtree cache into chunk buffer");

    chunk_cache.put(tag, buf.clone())?;

    let mut obj_writer = driver.objstore().put_object_async(vec![tag.to_string()]).await?;
    obj_writer.write_all(&buf)?;
    obj_writer.close()?;
    Ok(())
}

#[cfg(test)]
#[path = "datum_tests.rs"]
mod tests;
