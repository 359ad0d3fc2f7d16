//! Resource tags attached to staged videos and processing jobs for cost
//! accounting. Keys are namespaced by the configured organization.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::ObjectTag;
use crate::error::ConfigError;

/// Staged objects carry a deletion hint this many days in the future.
pub const RETENTION_DAYS: i64 = 90;

const MAX_TAG_VALUE_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagSettings {
    pub organization: String,
    pub project_number: String,
    pub stage: String,
    pub application: String,
}

impl Default for TagSettings {
    fn default() -> Self {
        Self {
            organization: "mbari".to_string(),
            project_number: "902005".to_string(),
            stage: "prod".to_string(),
            application: "detection-tracking".to_string(),
        }
    }
}

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || "+-=._:/@".contains(c)
}

fn check(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || !value.chars().all(is_allowed) {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!(
                "'{value}' must be non-empty and use only letters, digits, spaces \
                 and + - = . _ : / @"
            ),
        });
    }
    Ok(())
}

/// Free text is made tag-safe rather than rejected.
fn sanitise(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if is_allowed(c) { c } else { '_' })
        .take(MAX_TAG_VALUE_LEN)
        .collect();
    cleaned.trim().to_string()
}

/// Builds the tag set for resources created on behalf of `user_name`.
/// Values taken from configuration must already be valid; the description is
/// sanitised.
pub fn build_tags(
    settings: &TagSettings,
    user_name: &str,
    description: &str,
    now: DateTime<Utc>,
) -> Result<Vec<ObjectTag>, ConfigError> {
    check("tags.organization", &settings.organization)?;
    check("tags.project_number", &settings.project_number)?;
    check("tags.stage", &settings.stage)?;
    check("tags.application", &settings.application)?;

    let owner = match sanitise(user_name) {
        name if name.is_empty() => "unknown".to_string(),
        name => name,
    };
    let deletion_date = (now + Duration::days(RETENTION_DAYS))
        .format("%Y%m%dT%H%M%SZ")
        .to_string();

    let org = &settings.organization;
    let tags = vec![
        ObjectTag::new(format!("{org}:project-number"), &settings.project_number),
        ObjectTag::new(format!("{org}:owner"), &owner),
        ObjectTag::new(format!("{org}:description"), sanitise(description)),
        ObjectTag::new(format!("{org}:stage"), &settings.stage),
        ObjectTag::new(format!("{org}:application"), &settings.application),
        ObjectTag::new(format!("{org}:deletion-date"), deletion_date),
        ObjectTag::new(format!("{org}:created-by"), &owner),
    ];
    debug!(count = tags.len(), "Built resource tags");
    Ok(tags)
}
