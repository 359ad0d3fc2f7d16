//! Validated job specification.
//!
//! [`build`] is pure: it performs every check that can fail before a network
//! call is made, so a [`JobSpec`] that exists is always submittable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EffectiveConfig;
use crate::enumerate::VideoInput;
use crate::error::BuildError;
use crate::location::S3Uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tracker {
    DeepSort,
    StrongSort,
}

impl Tracker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tracker::DeepSort => "deepsort",
            Tracker::StrongSort => "strongsort",
        }
    }
}

impl FromStr for Tracker {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deepsort" => Ok(Tracker::DeepSort),
            "strongsort" => Ok(Tracker::StrongSort),
            _ => Err(BuildError::UnknownTracker(s.to_string())),
        }
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    pub job_name: String,
    pub inputs: Vec<VideoInput>,
    pub tracker: Tracker,
    pub model: S3Uri,
    pub conf_thres: f64,
    pub iou_thres: f64,
    pub exclude: Vec<String>,
    /// Detector input size in pixels.
    pub model_size: u32,
    /// Tracker configuration; `None` uses the configured one for the tracker.
    pub track_config: Option<S3Uri>,
    /// Re-identification weights, kept only for strongsort.
    pub reid_model: Option<String>,
}

impl JobSpec {
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }
}

/// What the user asked for. `None` fields fall back to the effective config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRequest {
    pub job_name: String,
    pub tracker: Option<String>,
    pub model: Option<String>,
    pub conf_thres: Option<f64>,
    pub iou_thres: Option<f64>,
    pub exclude: Vec<String>,
    pub model_size: Option<u32>,
    pub config_s3: Option<String>,
    pub reid_model_url: Option<String>,
}

fn threshold(name: &'static str, value: f64) -> Result<f64, BuildError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(BuildError::ThresholdOutOfRange { name, value })
    }
}

fn model_ref(raw: &str) -> Result<S3Uri, BuildError> {
    S3Uri::parse(raw)
        .filter(|uri| !uri.key().is_empty())
        .ok_or_else(|| BuildError::InvalidModelRef(raw.to_string()))
}

/// The detector downsamples by 32, so sizes must be positive multiples of it.
fn model_size(value: u32) -> Result<u32, BuildError> {
    if value > 0 && value % 32 == 0 {
        Ok(value)
    } else {
        Err(BuildError::InvalidModelSize(value))
    }
}

fn track_config(raw: Option<&str>) -> Result<Option<S3Uri>, BuildError> {
    match raw.map(str::trim).filter(|r| !r.is_empty()) {
        None => Ok(None),
        Some(raw) => S3Uri::parse(raw)
            .filter(|uri| !uri.key().is_empty())
            .map(Some)
            .ok_or_else(|| BuildError::InvalidTrackConfigRef(raw.to_string())),
    }
}

fn reid_model(raw: Option<&str>, tracker: Tracker) -> Option<String> {
    let url = raw.map(str::trim).filter(|r| !r.is_empty())?;
    if tracker != Tracker::StrongSort {
        warn!(
            url,
            tracker = %tracker,
            "Re-identification weights are only used by strongsort; ignoring"
        );
        return None;
    }
    Some(url.to_string())
}

/// Assembles a [`JobSpec`] from enumerated inputs, the effective config and the
/// user's request.
pub fn build(
    inputs: Vec<VideoInput>,
    config: &EffectiveConfig,
    request: &JobRequest,
) -> Result<JobSpec, BuildError> {
    let job_name = request.job_name.trim();
    if job_name.is_empty() {
        return Err(BuildError::EmptyJobName);
    }
    if inputs.is_empty() {
        warn!(job_name, "Nothing to submit after exclusions");
        return Err(BuildError::EmptyInputSet);
    }

    let conf_thres = threshold("confidence", request.conf_thres.unwrap_or(config.conf_thres))?;
    let iou_thres = threshold("iou", request.iou_thres.unwrap_or(config.iou_thres))?;
    let tracker: Tracker = request.tracker.as_deref().unwrap_or(&config.tracker).parse()?;
    let model = model_ref(request.model.as_deref().unwrap_or(&config.model))?;
    let model_size = model_size(request.model_size.unwrap_or(config.model_size))?;
    let track_config = track_config(request.config_s3.as_deref())?;

    let spec = JobSpec {
        job_name: job_name.to_string(),
        inputs,
        tracker,
        model,
        conf_thres,
        iou_thres,
        exclude: request.exclude.clone(),
        model_size,
        track_config,
        reid_model: reid_model(request.reid_model_url.as_deref(), tracker),
    };
    debug!(
        job_name = %spec.job_name,
        inputs = spec.input_count(),
        tracker = %spec.tracker,
        model = %spec.model,
        "Built job spec"
    );
    Ok(spec)
}
