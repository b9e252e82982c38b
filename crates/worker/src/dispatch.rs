//! Subtask classification and routing.

use std::sync::Arc;

use dfl_common::{DflError, Result};
use tracing::{error, info};

use crate::datum::handle_datum_task;
use crate::driver::Driver;
use crate::merge::handle_merge_task;
use crate::status::Status;
use crate::task::{
    deserialize_datum_data, deserialize_merge_data, serialize_datum_data, serialize_merge_data,
    Subtask,
};

/// Classify and run one coordinator-issued subtask.
///
/// The payload is try-decoded as a datum batch first, then as a shard merge;
/// on success the mutated payload is re-encoded into the subtask. Errors are
/// logged with their full cause chain and the first error is returned.
pub async fn handle_subtask(
    driver: &Arc<dyn Driver>,
    status: &Arc<Status>,
    subtask: &mut Subtask,
) -> Result<()> {
    let result = route_subtask(driver, status, subtask).await;
    if let Err(err) = &result {
        error!(subtask_id = %subtask.id, error = %err, "subtask failed");
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            error!(subtask_id = %subtask.id, cause = %cause, "caused by");
            source = cause.source();
        }
    }
    result
}

async fn route_subtask(
    driver: &Arc<dyn Driver>,
    status: &Arc<Status>,
    subtask: &mut Subtask,
) -> Result<()> {
    if let Ok(mut data) = deserialize_datum_data(&subtask.payload) {
        let job_id = data.job_id.clone();
        return status
            .with_job(&job_id, async {
                info!(job_id = %data.job_id, subtask_id = %subtask.id, "datum task");
                handle_datum_task(driver, status, &mut data, &subtask.id).await?;
                subtask.payload = serialize_datum_data(&data)?;
                Ok(())
            })
            .await;
    }

    if let Ok(mut data) = deserialize_merge_data(&subtask.payload) {
        let job_id = data.job_id.clone();
        return status
            .with_job(&job_id, async {
                info!(job_id = %data.job_id, subtask_id = %subtask.id, "merge task");
                handle_merge_task(driver, &mut data).await?;
                subtask.payload = serialize_merge_data(&data)?;
                Ok(())
            })
            .await;
    }

    Err(DflError::UnrecognizedTask)
}
