//! Role resolution: which IAM role submitted jobs run under.
//!
//! The environment always wins over the config profile. A stale role left in a
//! profile from a previous account is the most common operator error, so the
//! resolver never falls back from a malformed environment value to the
//! profile: it fails with [`RoleError::MalformedArn`] instead.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{RoleError, RoleOrigin};

/// Environment variable consulted before any config profile.
pub const ROLE_ENV_VAR: &str = "SAGEMAKER_ROLE";

fn arn_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^arn:aws[a-z-]*:iam::(\d{12}):role/[A-Za-z0-9+=,.@_/-]+$")
            .expect("role ARN pattern is valid")
    })
}

/// A syntactically valid IAM role ARN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RoleArn(String);

impl RoleArn {
    fn parse_from(value: &str, origin: RoleOrigin) -> Result<Self, RoleError> {
        let value = value.trim();
        if arn_pattern().is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(RoleError::MalformedArn {
                origin,
                value: value.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The twelve-digit account the role belongs to.
    pub fn account_id(&self) -> &str {
        arn_pattern()
            .captures(&self.0)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .unwrap_or_default()
    }
}

impl FromStr for RoleArn {
    type Err = RoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_from(s, RoleOrigin::ConfigProfile)
    }
}

impl fmt::Display for RoleArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves the role from the environment value first, then the config value.
/// Blank values count as absent.
pub fn resolve_role(
    env_value: Option<&str>,
    config_value: Option<&str>,
) -> Result<RoleArn, RoleError> {
    let candidates = [
        (RoleOrigin::Environment, env_value),
        (RoleOrigin::ConfigProfile, config_value),
    ];

    for (origin, value) in candidates {
        let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            continue;
        };
        return match RoleArn::parse_from(raw, origin) {
            Ok(arn) => {
                debug!(%origin, role = %arn, "Resolved submission role");
                Ok(arn)
            }
            Err(e) => {
                error!(%origin, value = raw, "Role value is not a valid IAM role ARN");
                Err(e)
            }
        };
    }

    warn!("No role found in {} or config profile", ROLE_ENV_VAR);
    Err(RoleError::Unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_ROLE: &str = "arn:aws:iam::872338704006:role/DeepSeaAI";
    const PROFILE_ROLE: &str = "arn:aws:iam::168552337187:role/service-role/DeepSeaAI-Stale";

    #[test]
    fn environment_wins_over_a_valid_profile_role() {
        let role = resolve_role(Some(ENV_ROLE), Some(PROFILE_ROLE)).unwrap();
        assert_eq!(role.as_str(), ENV_ROLE);
        assert_eq!(role.account_id(), "872338704006");
    }

    #[test]
    fn falls_back_to_profile_when_environment_is_absent_or_blank() {
        assert_eq!(
            resolve_role(None, Some(PROFILE_ROLE)).unwrap().as_str(),
            PROFILE_ROLE
        );
        assert_eq!(
            resolve_role(Some("  "), Some(PROFILE_ROLE)).unwrap().as_str(),
            PROFILE_ROLE
        );
    }

    #[test]
    fn unresolved_when_no_source_has_a_value() {
        assert_eq!(resolve_role(None, None), Err(RoleError::Unresolved));
        assert_eq!(resolve_role(Some(""), Some("")), Err(RoleError::Unresolved));
    }

    #[test]
    fn malformed_environment_value_does_not_fall_back_to_profile() {
        let err = resolve_role(Some("DeepSeaAI"), Some(PROFILE_ROLE)).unwrap_err();
        assert_eq!(
            err,
            RoleError::MalformedArn {
                origin: RoleOrigin::Environment,
                value: "DeepSeaAI".into()
            }
        );
    }

    #[test]
    fn rejects_non_role_arns() {
        for bad in [
            "arn:aws:iam::123:role/short-account",
            "arn:aws:s3:::bucket",
            "arn:aws:iam::872338704006:user/someone",
        ] {
            assert!(
                matches!(
                    resolve_role(None, Some(bad)),
                    Err(RoleError::MalformedArn { .. })
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_other_partitions() {
        let arn = "arn:aws-us-gov:iam::872338704006:role/DeepSeaAI";
        assert_eq!(resolve_role(Some(arn), None).unwrap().as_str(), arn);
    }
}
