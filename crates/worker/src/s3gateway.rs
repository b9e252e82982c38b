//! Readiness probe for the per-job sidecar S3 gateway.
//!
//! Pipelines with S3 inputs or S3 output must not start work before the
//! gateway answers. The probe retries with logging under a bounded backoff;
//! on exhaustion the last error is returned and failing the job is left to
//! the coordinator.

use std::time::{Duration, Instant};

use dfl_common::{sidecar_s3_gateway_service, DflError, Result, S3_GATEWAY_PORT_ENV};
use tracing::info;

/// Overrides the sidecar service name when the gateway is reachable at a
/// fixed address instead of through service discovery.
pub const S3_GATEWAY_HOST_ENV: &str = "DFL_S3_GATEWAY_HOST";

const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const PROBE_MAX_BACKOFF: Duration = Duration::from_secs(10);
const PROBE_MAX_ELAPSED: Duration = Duration::from_secs(60);

/// Poll the job's sidecar S3 gateway until it answers or the retry budget is
/// spent.
pub async fn check_s3_gateway(job_id: &str) -> Result<()> {
    let port = std::env::var(S3_GATEWAY_PORT_ENV)
        .map_err(|_| DflError::InvalidConfig(format!("{S3_GATEWAY_PORT_ENV} is not set")))?;
    let host = std::env::var(S3_GATEWAY_HOST_ENV)
        .unwrap_or_else(|_| sidecar_s3_gateway_service(job_id));
    check_endpoint(&format!("http://{host}:{port}/"), PROBE_MAX_ELAPSED).await
}

pub(crate) async fn check_endpoint(endpoint: &str, max_elapsed: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| DflError::InvalidConfig(format!("probe client build failed: {e}")))?;

    let started = Instant::now();
    let mut delay = PROBE_INITIAL_BACKOFF;
    loop {
        let err = match client.get(endpoint).send().await {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                return Ok(());
            }
            Ok(resp) => DflError::Storage(format!("s3 gateway returned {}", resp.status())),
            Err(err) => DflError::Storage(format!("s3 gateway unreachable: {err}")),
        };
        info!(endpoint, error = %err, "could not connect to s3 gateway, retrying");
        if started.elapsed() >= max_elapsed {
            return Err(err);
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 3 / 2).min(PROBE_MAX_BACKOFF);
    }
}
