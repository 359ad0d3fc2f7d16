//! Staging: copies local videos into the object store before submission.
//!
//! Objects that already exist are left alone, so re-running a submission does
//! not re-upload terabytes of video. Every video, uploaded or not, is tagged.

use std::time::Duration;

use tracing::{debug, info};

use crate::backend::retry::{with_timeout, RetryPolicy};
use crate::contract::{ObjectStore, ObjectTag};
use crate::enumerate::VideoInput;
use crate::error::BackendError;
use crate::location::S3Uri;

/// Where `video` lives once staged below `root`.
pub fn staged_uri(root: &S3Uri, video: &VideoInput) -> S3Uri {
    root.join(&video.object_key())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagingReport {
    pub uploaded: Vec<S3Uri>,
    pub skipped: Vec<S3Uri>,
}

impl StagingReport {
    pub fn total(&self) -> usize {
        self.uploaded.len() + self.skipped.len()
    }
}

/// Stages `videos` below `root`, stopping at the first failure.
pub async fn stage_inputs(
    store: &dyn ObjectStore,
    videos: &[VideoInput],
    root: &S3Uri,
    tags: &[ObjectTag],
    retry: &RetryPolicy,
    call_timeout: Duration,
) -> Result<StagingReport, BackendError> {
    info!(count = videos.len(), root = %root, "[STAGE] Staging videos");
    let mut report = StagingReport::default();

    for video in videos {
        let uri = staged_uri(root, video);
        let exists = retry
            .run("head object", || {
                with_timeout("head object", call_timeout, store.object_exists(&uri))
            })
            .await?;

        if exists {
            debug!(uri = %uri, "[STAGE] Object exists, skipping upload");
        } else {
            info!(video = %video.path.display(), uri = %uri, "[STAGE] Uploading");
            retry
                .run("upload", || store.upload_file(&video.path, &uri))
                .await?;
        }

        retry
            .run("tag object", || {
                with_timeout("tag object", call_timeout, store.tag_object(&uri, tags))
            })
            .await?;

        if exists {
            report.skipped.push(uri);
        } else {
            report.uploaded.push(uri);
        }
    }

    info!(
        uploaded = report.uploaded.len(),
        skipped = report.skipped.len(),
        "[STAGE] Staging complete"
    );
    Ok(report)
}
