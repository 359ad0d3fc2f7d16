//! Effective configuration: merges CLI flags, environment variables, a named
//! config profile and built-in defaults into one immutable [`EffectiveConfig`].
//!
//! Precedence is applied per field, highest first:
//!
//! 1. explicit CLI flag ([`CliOverrides`])
//! 2. environment variable ([`EnvVars`])
//! 3. the selected profile section of a [`ProfileDocument`]
//! 4. built-in default
//!
//! [`resolve`] is a pure function of its three inputs: the environment is
//! passed in as a snapshot and the profile document is already parsed, so the
//! same inputs always produce the same config.
//!
//! The role is the one field without a default; it is resolved by
//! [`crate::role::resolve_role`] (environment first) and a missing role is a
//! [`ConfigError::MissingRole`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ConfigError, RoleError};
use crate::job::Tracker;
use crate::role::{resolve_role, RoleArn, ROLE_ENV_VAR};
use crate::tags::TagSettings;

pub const DEFAULT_REGION: &str = "us-west-2";
pub const DEFAULT_TRACKER: &str = "strongsort";
pub const DEFAULT_CONF_THRES: f64 = 0.01;
pub const DEFAULT_IOU_THRES: f64 = 0.1;
pub const DEFAULT_MODEL: &str = "s3://902005-public/models/yolov5x_mbay_benthic_model.tar.gz";
pub const DEFAULT_INSTANCE_TYPE: &str = "ml.g4dn.xlarge";
pub const DEFAULT_MODEL_SIZE: u32 = 640;
pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_PROFILE: &str = "default";

pub const PROFILE_ENV_VAR: &str = "DEEPSEA_AI_PROFILE";
pub const MODEL_ENV_VAR: &str = "DEEPSEA_AI_MODEL";
pub const TRACKER_ENV_VAR: &str = "DEEPSEA_AI_TRACKER";
pub const CONF_THRES_ENV_VAR: &str = "DEEPSEA_AI_CONF_THRES";
pub const IOU_THRES_ENV_VAR: &str = "DEEPSEA_AI_IOU_THRES";
pub const REGION_ENV_VARS: [&str; 2] = ["AWS_REGION", "AWS_DEFAULT_REGION"];

/// Snapshot of the process environment. Blank values are treated as unset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars(BTreeMap<String, String>);

impl EnvVars {
    pub fn from_process() -> Self {
        Self(std::env::vars().collect())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A per-tracker pair of settings (container image, track config, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerTable {
    pub deepsort: Option<String>,
    pub strongsort: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
}

/// One named section of a config profile document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSection {
    pub region: Option<String>,
    pub role_arn: Option<String>,
    pub model: Option<String>,
    pub tracker: Option<String>,
    pub conf_thres: Option<f64>,
    pub iou_thres: Option<f64>,
    pub instance_type: Option<String>,
    pub model_size: Option<u32>,
    pub input_s3: Option<String>,
    pub output_s3: Option<String>,
    pub images: TrackerTable,
    pub track_configs: TrackerTable,
    pub cluster: ClusterSection,
}

/// A parsed config profile document: several named sections so multiple
/// accounts can coexist in one file, plus tag settings shared by all of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileDocument {
    pub default_profile: Option<String>,
    pub profiles: BTreeMap<String, ProfileSection>,
    pub tags: TagSettings,
}

/// Values given on the command line; `None` means the flag was not supplied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub profile: Option<String>,
    pub region: Option<String>,
    pub model: Option<String>,
    pub tracker: Option<String>,
    pub conf_thres: Option<f64>,
    pub iou_thres: Option<f64>,
    pub instance_type: Option<String>,
    pub input_s3: Option<String>,
    pub output_s3: Option<String>,
    pub batch_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub model_size: Option<u32>,
    /// Tracker configuration to use instead of the profile's.
    pub config_s3: Option<String>,
    /// Re-identification weights; only the strongsort tracker reads them.
    pub reid_model_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    pub deepsort: String,
    pub strongsort: String,
}

impl TrackerSettings {
    pub fn for_tracker(&self, tracker: Tracker) -> &str {
        match tracker {
            Tracker::DeepSort => &self.deepsort,
            Tracker::StrongSort => &self.strongsort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSettings {
    pub batch_size: usize,
    pub concurrency: usize,
}

/// The fully resolved configuration of one invocation. Built once, never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    pub profile: String,
    pub region: String,
    pub role: RoleArn,
    pub model: String,
    pub tracker: String,
    pub conf_thres: f64,
    pub iou_thres: f64,
    pub instance_type: String,
    pub model_size: u32,
    pub images: TrackerSettings,
    pub track_configs: TrackerSettings,
    pub input_s3: Option<String>,
    pub output_s3: Option<String>,
    pub cluster: ClusterSettings,
    pub tags: TagSettings,
}

impl EffectiveConfig {
    pub fn trace_loaded(&self) {
        info!(
            profile = %self.profile,
            region = %self.region,
            role = %self.role,
            tracker = %self.tracker,
            model = %self.model,
            conf_thres = self.conf_thres,
            iou_thres = self.iou_thres,
            "Resolved effective configuration"
        );
        debug!(?self, "Effective configuration (full debug)");
    }
}

fn default_images() -> TrackerSettings {
    TrackerSettings {
        deepsort: "mbari/deepsort-yolov5:1.3.5".to_string(),
        strongsort: "mbari/strongsort-yolov5:1.5.0".to_string(),
    }
}

fn default_track_configs() -> TrackerSettings {
    TrackerSettings {
        deepsort: "s3://902005-public/models/track-config/deep_sort.yaml".to_string(),
        strongsort: "s3://902005-public/models/track-config/strong_sort.yaml".to_string(),
    }
}

fn first<T>(candidates: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    candidates.into_iter().flatten().next()
}

fn env_number<T: std::str::FromStr>(
    env: &EnvVars,
    key: &'static str,
    profile: &str,
) -> Result<Option<T>, ConfigError> {
    match env.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::InvalidProfile {
            profile: profile.to_string(),
            reason: format!("environment variable {key}='{raw}' is not a number"),
        }),
    }
}

fn selected_profile_name(
    cli: &CliOverrides,
    env: &EnvVars,
    document: Option<&ProfileDocument>,
) -> (String, bool) {
    let explicit = first([
        cli.profile.clone(),
        env.get(PROFILE_ENV_VAR).map(str::to_string),
        document.and_then(|d| d.default_profile.clone()),
    ]);
    match explicit {
        Some(name) => (name, true),
        None => (DEFAULT_PROFILE.to_string(), false),
    }
}

fn select_section(
    cli: &CliOverrides,
    env: &EnvVars,
    document: Option<&ProfileDocument>,
) -> Result<(String, ProfileSection), ConfigError> {
    let (name, explicit) = selected_profile_name(cli, env, document);
    let section = document.and_then(|d| d.profiles.get(&name)).cloned();
    match section {
        Some(section) => Ok((name, section)),
        None if explicit => Err(ConfigError::InvalidProfile {
            reason: match document {
                Some(d) => format!(
                    "no such profile; available: [{}]",
                    d.profiles.keys().cloned().collect::<Vec<_>>().join(", ")
                ),
                None => "no config file was given".to_string(),
            },
            profile: name,
        }),
        None => Ok((name, ProfileSection::default())),
    }
}

fn resolve_region(cli: &CliOverrides, env: &EnvVars, section: &ProfileSection) -> String {
    first([
        cli.region.clone(),
        env.get(REGION_ENV_VARS[0]).map(str::to_string),
        env.get(REGION_ENV_VARS[1]).map(str::to_string),
        section.region.clone(),
    ])
    .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// Region only, for callers that must create cloud clients before the full
/// configuration is resolved.
pub fn preview_region(
    cli: &CliOverrides,
    document: Option<&ProfileDocument>,
    env: &EnvVars,
) -> Result<String, ConfigError> {
    let (_, section) = select_section(cli, env, document)?;
    Ok(resolve_region(cli, env, &section))
}

fn at_least_one(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

/// Resolves the effective configuration for one invocation.
pub fn resolve(
    cli: &CliOverrides,
    document: Option<&ProfileDocument>,
    env: &EnvVars,
) -> Result<EffectiveConfig, ConfigError> {
    let (profile, section) = select_section(cli, env, document)?;
    debug!(profile = %profile, "Selected config profile");

    let role = resolve_role(env.get(ROLE_ENV_VAR), section.role_arn.as_deref()).map_err(
        |e| match e {
            RoleError::Unresolved => ConfigError::MissingRole {
                profile: profile.clone(),
            },
            other => ConfigError::Role(other),
        },
    )?;

    let region = resolve_region(cli, env, &section);

    let model = first([
        cli.model.clone(),
        env.get(MODEL_ENV_VAR).map(str::to_string),
        section.model.clone(),
    ])
    .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    let tracker = first([
        cli.tracker.clone(),
        env.get(TRACKER_ENV_VAR).map(str::to_string),
        section.tracker.clone(),
    ])
    .unwrap_or_else(|| DEFAULT_TRACKER.to_string());

    let conf_thres = first([
        cli.conf_thres,
        env_number(env, CONF_THRES_ENV_VAR, &profile)?,
        section.conf_thres,
    ])
    .unwrap_or(DEFAULT_CONF_THRES);

    let iou_thres = first([
        cli.iou_thres,
        env_number(env, IOU_THRES_ENV_VAR, &profile)?,
        section.iou_thres,
    ])
    .unwrap_or(DEFAULT_IOU_THRES);

    let defaults = default_images();
    let images = TrackerSettings {
        deepsort: section.images.deepsort.clone().unwrap_or(defaults.deepsort),
        strongsort: section.images.strongsort.clone().unwrap_or(defaults.strongsort),
    };
    let defaults = default_track_configs();
    let track_configs = TrackerSettings {
        deepsort: section.track_configs.deepsort.clone().unwrap_or(defaults.deepsort),
        strongsort: section.track_configs.strongsort.clone().unwrap_or(defaults.strongsort),
    };

    let cluster = ClusterSettings {
        batch_size: at_least_one(
            "batch_size",
            first([cli.batch_size, section.cluster.batch_size]).unwrap_or(DEFAULT_BATCH_SIZE),
        )?,
        concurrency: at_least_one(
            "concurrency",
            first([cli.concurrency, section.cluster.concurrency]).unwrap_or(DEFAULT_CONCURRENCY),
        )?,
    };

    let config = EffectiveConfig {
        region,
        role,
        model,
        tracker,
        conf_thres,
        iou_thres,
        instance_type: first([cli.instance_type.clone(), section.instance_type.clone()])
            .unwrap_or_else(|| DEFAULT_INSTANCE_TYPE.to_string()),
        model_size: first([cli.model_size, section.model_size]).unwrap_or(DEFAULT_MODEL_SIZE),
        images,
        track_configs,
        input_s3: first([cli.input_s3.clone(), section.input_s3.clone()]),
        output_s3: first([cli.output_s3.clone(), section.output_s3.clone()]),
        cluster,
        tags: document.map(|d| d.tags.clone()).unwrap_or_default(),
        profile,
    };
    config.trace_loaded();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_ROLE: &str = "arn:aws:iam::168552337187:role/DeepSeaAI";
    const ENV_ROLE: &str = "arn:aws:iam::872338704006:role/DeepSeaAI";

    fn document() -> ProfileDocument {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "mbari".to_string(),
            ProfileSection {
                region: Some("us-east-1".into()),
                role_arn: Some(PROFILE_ROLE.into()),
                tracker: Some("deepsort".into()),
                conf_thres: Some(0.25),
                ..ProfileSection::default()
            },
        );
        profiles.insert(
            "no-role".to_string(),
            ProfileSection {
                region: Some("eu-west-1".into()),
                ..ProfileSection::default()
            },
        );
        ProfileDocument {
            default_profile: Some("mbari".into()),
            profiles,
            tags: TagSettings::default(),
        }
    }

    #[test]
    fn defaults_fill_every_field_not_set_elsewhere() {
        let env: EnvVars = [(ROLE_ENV_VAR, ENV_ROLE)].into_iter().collect();
        let config = resolve(&CliOverrides::default(), None, &env).unwrap();
        assert_eq!(config.profile, DEFAULT_PROFILE);
        assert_eq!(config.region, DEFAULT_REGION);
        assert_eq!(config.tracker, DEFAULT_TRACKER);
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.conf_thres, DEFAULT_CONF_THRES);
        assert_eq!(config.iou_thres, DEFAULT_IOU_THRES);
        assert_eq!(config.cluster.batch_size, 1);
        assert_eq!(config.cluster.concurrency, 8);
    }

    #[test]
    fn precedence_is_applied_per_field() {
        // profile supplies role and tracker, environment supplies the region,
        // the CLI supplies the confidence threshold.
        let doc = document();
        let env: EnvVars = [("AWS_REGION", "us-west-1")].into_iter().collect();
        let cli = CliOverrides {
            conf_thres: Some(0.5),
            ..CliOverrides::default()
        };
        let config = resolve(&cli, Some(&doc), &env).unwrap();
        assert_eq!(config.profile, "mbari");
        assert_eq!(config.role.as_str(), PROFILE_ROLE);
        assert_eq!(config.region, "us-west-1");
        assert_eq!(config.tracker, "deepsort");
        assert_eq!(config.conf_thres, 0.5);
    }

    #[test]
    fn cli_beats_environment_beats_profile() {
        let doc = document();
        let env: EnvVars = [(TRACKER_ENV_VAR, "strongsort"), (CONF_THRES_ENV_VAR, "0.3")]
            .into_iter()
            .collect();
        let from_env = resolve(&CliOverrides::default(), Some(&doc), &env).unwrap();
        assert_eq!(from_env.tracker, "strongsort");
        assert_eq!(from_env.conf_thres, 0.3);

        let cli = CliOverrides {
            tracker: Some("deepsort".into()),
            ..CliOverrides::default()
        };
        assert_eq!(resolve(&cli, Some(&doc), &env).unwrap().tracker, "deepsort");
    }

    #[test]
    fn environment_role_wins_over_profile_role() {
        let doc = document();
        let env: EnvVars = [(ROLE_ENV_VAR, ENV_ROLE)].into_iter().collect();
        let config = resolve(&CliOverrides::default(), Some(&doc), &env).unwrap();
        assert_eq!(config.role.as_str(), ENV_ROLE);
    }

    #[test]
    fn missing_role_names_the_profile() {
        let doc = document();
        let cli = CliOverrides {
            profile: Some("no-role".into()),
            ..CliOverrides::default()
        };
        let err = resolve(&cli, Some(&doc), &EnvVars::default()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingRole {
                profile: "no-role".into()
            }
        );
    }

    #[test]
    fn unknown_explicit_profile_is_invalid() {
        let doc = document();
        let env: EnvVars = [(PROFILE_ENV_VAR, "elsewhere"), (ROLE_ENV_VAR, ENV_ROLE)]
            .into_iter()
            .collect();
        let err = resolve(&CliOverrides::default(), Some(&doc), &env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidProfile { profile, .. } if profile == "elsewhere"
        ));
    }

    #[test]
    fn unparseable_threshold_in_environment_is_invalid() {
        let env: EnvVars = [(ROLE_ENV_VAR, ENV_ROLE), (IOU_THRES_ENV_VAR, "high")]
            .into_iter()
            .collect();
        let err = resolve(&CliOverrides::default(), None, &env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidProfile { .. }));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let env: EnvVars = [(ROLE_ENV_VAR, ENV_ROLE)].into_iter().collect();
        let cli = CliOverrides {
            concurrency: Some(0),
            ..CliOverrides::default()
        };
        let err = resolve(&cli, None, &env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "concurrency", .. }));
    }

    #[test]
    fn resolving_twice_yields_identical_configs() {
        let doc = document();
        let env: EnvVars = [("AWS_DEFAULT_REGION", "ap-southeast-2")].into_iter().collect();
        let cli = CliOverrides {
            iou_thres: Some(0.45),
            ..CliOverrides::default()
        };
        let a = resolve(&cli, Some(&doc), &env).unwrap();
        let b = resolve(&cli, Some(&doc), &env).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.conf_thres.to_bits(), b.conf_thres.to_bits());
        assert_eq!(a.iou_thres.to_bits(), b.iou_thres.to_bits());
    }

    #[test]
    fn preview_region_matches_resolved_region() {
        let doc = document();
        let env: EnvVars = [(ROLE_ENV_VAR, ENV_ROLE)].into_iter().collect();
        let cli = CliOverrides::default();
        assert_eq!(
            preview_region(&cli, Some(&doc), &env).unwrap(),
            resolve(&cli, Some(&doc), &env).unwrap().region
        );
    }
}
