//! Expands an input path into the ordered set of videos to submit.
//!
//! Directories are walked recursively. Results are sorted by path and
//! deduplicated so job naming and task ordering are reproducible. Exclusion is
//! a case-sensitive substring match on the file name and runs last, so callers
//! always see the exact set that will be submitted.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::EnumerationError;

/// Accepted video suffixes, compared case-insensitively.
pub const VIDEO_EXTENSIONS: &[&str] = &["mov", "avi", "mp4", "mpg", "mpeg", "m4v", "wmv", "mkv"];

/// One source video.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct VideoInput {
    pub path: PathBuf,
    pub display_name: String,
}

impl VideoInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { path, display_name }
    }

    /// Object-store key this video is staged under: its parent directory
    /// (without any leading `/Volumes/` mount point) followed by the file name.
    pub fn object_key(&self) -> String {
        let parent = self
            .path
            .parent()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let parent = parent.strip_prefix("/Volumes/").unwrap_or(&parent);
        let parent = parent.trim_matches('/');
        if parent.is_empty() || parent == "." {
            self.display_name.clone()
        } else {
            format!("{}/{}", parent.trim_start_matches("./"), self.display_name)
        }
    }
}

/// True for files with an accepted suffix that are not AppleDouble (`._*`)
/// metadata files.
pub fn is_video_file(path: &Path) -> bool {
    let name_ok = path
        .file_name()
        .map(|n| !n.to_string_lossy().starts_with("._"))
        .unwrap_or(false);
    let ext_ok = path
        .extension()
        .map(|e| {
            let ext = e.to_string_lossy().to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false);
    name_ok && ext_ok
}

/// Empty patterns are ignored; they would otherwise exclude everything.
pub fn is_excluded(display_name: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|p| !p.is_empty() && display_name.contains(p.as_str()))
}

fn candidates(path: &Path) -> Result<Vec<PathBuf>, EnumerationError> {
    if !path.is_dir() {
        return Ok(if is_video_file(path) {
            vec![path.to_path_buf()]
        } else {
            Vec::new()
        });
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(path).follow_links(true) {
        let entry = entry.map_err(|e| EnumerationError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_file() && is_video_file(entry.path()) {
            found.push(entry.into_path());
        } else {
            debug!(path = %entry.path().display(), "Skipping non-video entry");
        }
    }
    Ok(found)
}

/// Enumerates the videos under `path`.
///
/// A single file that matches an exclusion yields an empty set, not an error;
/// emptiness is reported by the job builder.
pub fn enumerate(path: &Path, exclude: &[String]) -> Result<Vec<VideoInput>, EnumerationError> {
    if !path.exists() {
        warn!(path = %path.display(), "Input path does not exist");
        return Err(EnumerationError::NotFound(path.to_path_buf()));
    }

    if exclude.is_empty() {
        info!("No video file exclusions specified");
    } else {
        info!(?exclude, "Excluding any video file whose name contains a pattern");
    }

    let mut paths = candidates(path)?;
    paths.sort();
    paths.dedup();
    if paths.is_empty() {
        warn!(path = %path.display(), "No video files found");
        return Err(EnumerationError::NoVideoFiles(path.to_path_buf()));
    }

    let found = paths.len();
    let videos: Vec<VideoInput> = paths
        .into_iter()
        .map(VideoInput::new)
        .filter(|v| {
            let excluded = is_excluded(&v.display_name, exclude);
            if excluded {
                debug!(video = %v.display_name, "Excluded by pattern");
            }
            !excluded
        })
        .collect();

    info!(
        found,
        excluded = found - videos.len(),
        selected = videos.len(),
        "Enumerated videos"
    );
    Ok(videos)
}
