//! Staging for inbound file media.
//!
//! File items are written under `<workspace_root>/uploads` and referenced
//! by absolute path in the outgoing chat message. Staged files older than
//! the retention window are rotated away on each call.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use uuid::Uuid;

use common::types::MediaItem;

pub const UPLOAD_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const UPLOADS_DIR: &str = "uploads";

#[derive(Debug, thiserror::Error)]
#[error("upload staging failed: {message}")]
pub struct UploadError {
    message: String,
}

impl UploadError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Persist every file-media item and return the absolute staged paths, in
/// input order. Audio items are not staged here (they go to transcription).
pub fn stage_file_media(
    workspace_root: &Path,
    items: &[MediaItem],
) -> Result<Vec<PathBuf>, UploadError> {
    let dir = workspace_root.join(UPLOADS_DIR);
    std::fs::create_dir_all(&dir)
        .map_err(|err| UploadError::new(format!("create uploads dir failed: {err}")))?;

    if let Err(err) = rotate_stale(&dir, UPLOAD_RETENTION) {
        tracing::warn!("upload rotation failed: {err}");
    }

    let mut staged = Vec::new();
    for item in items {
        let MediaItem::File {
            file_name,
            content_base64,
        } = item
        else {
            continue;
        };
        let bytes = BASE64
            .decode(content_base64)
            .map_err(|err| UploadError::new(format!("invalid media base64: {err}")))?;
        let name = sanitized_name(file_name.as_deref());
        let unique = format!("{}-{name}", short_id());
        let path = dir.join(unique);
        std::fs::write(&path, &bytes)
            .map_err(|err| UploadError::new(format!("write staged file failed: {err}")))?;
        let absolute = path
            .canonicalize()
            .map_err(|err| UploadError::new(format!("canonicalize failed: {err}")))?;
        staged.push(absolute);
    }
    Ok(staged)
}

/// Delete staged files older than `max_age`. Returns how many were removed.
pub fn rotate_stale(dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut removed = 0;
    let now = SystemTime::now();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(now);
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > max_age {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Strip any directory components from a client-supplied name.
fn sanitized_name(raw: Option<&str>) -> String {
    let fallback = "upload.bin";
    let Some(raw) = raw else {
        return fallback.to_string();
    };
    let name = Path::new(raw)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.is_empty() || name == ".." {
        fallback.to_string()
    } else {
        name
    }
}

fn short_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}
