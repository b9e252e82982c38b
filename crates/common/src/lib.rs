#![deny(missing_docs)]

//! Shared configuration and error types for DatumFlow crates.
//!
//! Architecture role:
//! - defines the pipeline execution policy passed across layers
//! - provides common [`DflError`] / [`Result`] contracts
//! - names the environment variables the worker reads and exports
//!
//! Key modules:
//! - [`config`]
//! - [`error`]

/// Pipeline execution policy and environment names.
pub mod config;
/// Shared error taxonomy.
pub mod error;

pub use config::{
    sidecar_s3_gateway_service, PipelineInfo, JOB_ID_ENV, OUTPUT_COMMIT_ID_ENV,
    S3_GATEWAY_PORT_ENV, WORKER_IP_ENV,
};
pub use error::{DflError, Result};
