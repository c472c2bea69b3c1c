//! Typed job parameters.
//!
//! The scheduler hands the job a JSON map. It is decoded into [`GcParams`]
//! exactly once, before anything else runs, so a malformed parameter
//! surfaces as a configuration error instead of a failure halfway through
//! a run.

use chrono::Duration;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Connection URL of the backend registry's cache store. Required.
pub const PARAM_REDIS_URL: &str = "redis_url_reg";
/// Whether to sweep untagged artifacts into the trash. Optional.
pub const PARAM_DELETE_UNTAGGED: &str = "delete_untagged";
/// Push grace period in hours. Optional.
pub const PARAM_GRACE_PERIOD_HOURS: &str = "grace_period_hours";
/// Compute and report candidates without mutating anything. Optional.
pub const PARAM_DRY_RUN: &str = "dry_run";

/// Untagged artifacts are swept unless explicitly disabled.
pub const DEFAULT_DELETE_UNTAGGED: bool = true;

/// Blobs younger than this are never candidates: an in-flight push writes
/// its blobs before it links a manifest to them, and two hours comfortably
/// covers an upload plus the manifest PUT.
pub const DEFAULT_GRACE_PERIOD_HOURS: u64 = 2;

/// Error decoding the job-parameter map.
#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("job parameters must be a JSON object")]
    NotAnObject,

    #[error("missing required job parameter {0:?}")]
    Missing(&'static str),

    #[error("malformed job parameters: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct RawParams {
    redis_url_reg: Option<String>,
    delete_untagged: Option<bool>,
    grace_period_hours: Option<u64>,
    dry_run: Option<bool>,
}

/// Validated collection-run parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcParams {
    /// Cache-store connection URL (`redis_url_reg`).
    pub redis_url: String,
    /// Whether the run sweeps untagged artifacts (`delete_untagged`,
    /// default true).
    pub delete_untagged: bool,
    /// Minimum age for deletion candidates (`grace_period_hours`,
    /// default 2; zero disables the guard).
    pub grace_period: Duration,
    /// Report-only mode (`dry_run`, default false).
    pub dry_run: bool,
}

impl GcParams {
    /// Decode and validate a parameter map.
    pub fn from_value(params: &Value) -> Result<Self, ParamsError> {
        if !params.is_object() {
            return Err(ParamsError::NotAnObject);
        }
        let raw: RawParams = serde_json::from_value(params.clone())?;
        let redis_url = raw
            .redis_url_reg
            .filter(|url| !url.is_empty())
            .ok_or(ParamsError::Missing(PARAM_REDIS_URL))?;
        let grace_hours = raw.grace_period_hours.unwrap_or(DEFAULT_GRACE_PERIOD_HOURS);
        Ok(Self {
            redis_url,
            delete_untagged: raw.delete_untagged.unwrap_or(DEFAULT_DELETE_UNTAGGED),
            grace_period: Duration::hours(grace_hours as i64),
            dry_run: raw.dry_run.unwrap_or(false),
        })
    }
}
