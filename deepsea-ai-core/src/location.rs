use std::fmt;

use serde::Serialize;

/// An `s3://bucket/key` location. The key may be empty (bucket root) and never
/// carries leading or trailing slashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct S3Uri {
    bucket: String,
    key: String,
}

impl S3Uri {
    pub fn new(bucket: impl Into<String>, key: impl AsRef<str>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.as_ref().trim_matches('/').to_string(),
        }
    }

    /// Parses `s3://bucket[/key]`. Returns `None` for anything else.
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.trim().strip_prefix("s3://")?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() || bucket.contains(char::is_whitespace) {
            return None;
        }
        Some(Self::new(bucket, key))
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Appends a relative path below this location.
    pub fn join(&self, suffix: &str) -> Self {
        let suffix = suffix.trim_matches('/');
        if self.key.is_empty() {
            Self::new(self.bucket.clone(), suffix)
        } else if suffix.is_empty() {
            self.clone()
        } else {
            Self::new(self.bucket.clone(), format!("{}/{}", self.key, suffix))
        }
    }

    /// The location as a prefix, i.e. with a trailing slash.
    pub fn as_prefix(&self) -> String {
        if self.key.is_empty() {
            format!("s3://{}/", self.bucket)
        } else {
            format!("s3://{}/{}/", self.bucket, self.key)
        }
    }
}

impl fmt::Display for S3Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.key)
        }
    }
}
