use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable exporting the current job id to user code.
pub const JOB_ID_ENV: &str = "DFL_JOB_ID";
/// Environment variable exporting the output commit id to user code.
pub const OUTPUT_COMMIT_ID_ENV: &str = "DFL_OUTPUT_COMMIT_ID";
/// Environment variable holding the address peer workers use to reach this one.
pub const WORKER_IP_ENV: &str = "DFL_WORKER_IP";
/// Environment variable holding the sidecar S3 gateway port (integer string).
pub const S3_GATEWAY_PORT_ENV: &str = "S3GATEWAY_PORT";

/// Service name of the per-job sidecar S3 gateway.
pub fn sidecar_s3_gateway_service(job_id: &str) -> String {
    format!("s3-{job_id}")
}

/// Pipeline identity and execution policy shared by every subtask of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInfo {
    /// Pipeline name; part of every datum content hash.
    pub pipeline_name: String,
    /// Salt mixed into datum content hashes; rotating it invalidates prior outputs.
    pub salt: String,
    /// Transform command and arguments run once per datum.
    pub cmd: Vec<String>,
    /// Error-handler command run on the final retry of a failing datum.
    #[serde(default)]
    pub err_cmd: Option<Vec<String>>,
    /// Attempts per datum before it is marked failed.
    pub datum_tries: u64,
    /// Wall-clock bound for one user-code invocation.
    #[serde(default)]
    pub datum_timeout: Option<Duration>,
    /// Maximum in-flight datums per subtask.
    pub max_queue_size: usize,
    /// Whether per-datum stats trees are built and published.
    #[serde(default)]
    pub enable_stats: bool,
    /// Whether user code writes output through the S3 gateway instead of the
    /// worker filesystem.
    #[serde(default)]
    pub s3_out: bool,
    /// Whether any pipeline input is served through the S3 gateway.
    #[serde(default)]
    pub s3_inputs: bool,
    /// Namespace used to address the sidecar gateway service from user code.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for PipelineInfo {
    fn default() -> Self {
        Self {
            pipeline_name: "pipeline".to_string(),
            salt: String::new(),
            cmd: Vec::new(),
            err_cmd: None,
            datum_tries: 3,
            datum_timeout: None,
            max_queue_size: 8,
            enable_stats: false,
            s3_out: false,
            s3_inputs: false,
            namespace: default_namespace(),
        }
    }
}

impl PipelineInfo {
    /// Whether this pipeline touches S3-compatible endpoints on either side.
    pub fn uses_s3_gateway(&self) -> bool {
        self.s3_inputs || self.s3_out
    }
}
