//! Transcript media scraping.
//!
//! The latest assistant message in a session transcript may carry
//! `MEDIA: <path>` directive lines pointing at files to attach to the
//! outgoing reply. Paths must stay inside the Gateway state dir; files are
//! size- and count-capped and returned base64-encoded with a sniffed
//! content type.

use std::path::{Component, Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;

use common::types::OutboundMedia;

use crate::sessions;

pub const MAX_MEDIA_FILE_BYTES: u64 = 5 * 1024 * 1024;
pub const MAX_MEDIA_FILES: usize = 4;
const MEDIA_DIRECTIVE: &str = "MEDIA:";

#[derive(Debug, thiserror::Error)]
#[error("media scrape failed: {message}")]
pub struct MediaError {
    message: String,
}

impl MediaError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Read the session transcript and return attachments for every valid
/// `MEDIA:` directive in the latest assistant message.
pub fn collect_transcript_media(
    state_dir: &Path,
    session_key: &str,
) -> Result<Vec<OutboundMedia>, MediaError> {
    let Some(transcript_path) = sessions::session_file(state_dir, session_key)
        .map_err(|err| MediaError::new(err.to_string()))?
    else {
        return Ok(Vec::new());
    };
    if !transcript_path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(&transcript_path)
        .map_err(|err| MediaError::new(format!("transcript read failed: {err}")))?;

    let Some(message_text) = latest_assistant_text(&raw) else {
        return Ok(Vec::new());
    };

    let mut attachments = Vec::new();
    for line in message_text.lines() {
        if attachments.len() >= MAX_MEDIA_FILES {
            tracing::warn!(session_key, "media attachment cap reached, dropping extra directives");
            break;
        }
        let Some(rest) = line.trim().strip_prefix(MEDIA_DIRECTIVE) else {
            continue;
        };
        let raw_path = rest.trim();
        if raw_path.is_empty() {
            continue;
        }
        let Some(path) = resolve_media_path(state_dir, raw_path) else {
            tracing::warn!(session_key, path = raw_path, "rejected media path");
            continue;
        };
        match load_attachment(&path) {
            Ok(Some(attachment)) => attachments.push(attachment),
            Ok(None) => {
                tracing::warn!(session_key, path = %path.display(), "media file too large, skipped");
            }
            Err(err) => {
                tracing::warn!(session_key, path = %path.display(), "media read failed: {err}");
            }
        }
    }
    Ok(attachments)
}

/// Validate a directive path: no `..` traversal, and absolute paths must
/// stay inside the state dir. Relative paths resolve under the state dir.
pub fn resolve_media_path(state_dir: &Path, raw: &str) -> Option<PathBuf> {
    let candidate = Path::new(raw);
    if candidate
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return None;
    }
    if candidate.is_absolute() {
        if candidate.starts_with(state_dir) {
            Some(candidate.to_path_buf())
        } else {
            None
        }
    } else {
        Some(state_dir.join(candidate))
    }
}

fn load_attachment(path: &Path) -> Result<Option<OutboundMedia>, MediaError> {
    let metadata = std::fs::metadata(path)
        .map_err(|err| MediaError::new(format!("metadata failed: {err}")))?;
    if metadata.len() > MAX_MEDIA_FILE_BYTES {
        return Ok(None);
    }
    let bytes =
        std::fs::read(path).map_err(|err| MediaError::new(format!("read failed: {err}")))?;
    let content_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok(Some(OutboundMedia {
        file_name: path
            .file_name()
            .map(|name| name.to_string_lossy().to_string()),
        content_type,
        content_base64: BASE64.encode(&bytes),
    }))
}

/// Last assistant message text in a JSONL transcript. Lines that fail to
/// parse are skipped; `content` may be a plain string or an array of
/// `{text}` parts.
fn latest_assistant_text(transcript: &str) -> Option<String> {
    let mut latest = None;
    for line in transcript.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        let record = value.get("message").unwrap_or(&value);
        if record.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        if let Some(text) = content_text(record.get("content")) {
            latest = Some(text);
        }
    }
    latest
}

fn content_text(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let joined: Vec<&str> = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join("\n"))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_session(state_dir: &Path, session_key: &str, transcript: &str) {
        let sessions_dir = state_dir.join("agents/main/sessions");
        if let Err(err) = std::fs::create_dir_all(&sessions_dir) {
            panic!("create sessions dir failed: {err}");
        }
        let transcript_path = sessions_dir.join(format!("{session_key}.jsonl"));
        if let Err(err) = std::fs::write(&transcript_path, transcript) {
            panic!("write transcript failed: {err}");
        }
        let map = format!(
            r#"{{"agent:main:{session_key}": {{"sessionFile": "{}"}}}}"#,
            transcript_path.to_string_lossy().replace('\\', "/")
        );
        if let Err(err) = std::fs::write(sessions_dir.join("sessions.json"), map) {
            panic!("write sessions map failed: {err}");
        }
    }

    #[test]
    fn resolve_rejects_traversal_and_outside_paths() {
        let state_dir = Path::new("/var/lib/openclaw");
        assert!(resolve_media_path(state_dir, "../etc/passwd").is_none());
        assert!(resolve_media_path(state_dir, "media/../../etc/passwd").is_none());
        assert!(resolve_media_path(state_dir, "/etc/passwd").is_none());
        assert_eq!(
            resolve_media_path(state_dir, "/var/lib/openclaw/media/a.png"),
            Some(PathBuf::from("/var/lib/openclaw/media/a.png"))
        );
        assert_eq!(
            resolve_media_path(state_dir, "media/a.png"),
            Some(PathBuf::from("/var/lib/openclaw/media/a.png"))
        );
    }

    #[test]
    fn scrapes_latest_assistant_message_only() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("temp dir failed: {err}"),
        };
        let media_path = dir.path().join("media/out.png");
        if let Err(err) = std::fs::create_dir_all(media_path.parent().unwrap_or(dir.path())) {
            panic!("create media dir failed: {err}");
        }
        if let Err(err) = std::fs::write(&media_path, b"\x89PNG fake") {
            panic!("write media failed: {err}");
        }

        let transcript = format!(
            "{}\n{}\n{}\n",
            r#"{"role":"assistant","content":"MEDIA: media/old.png"}"#,
            r#"{"role":"user","content":"show me"}"#,
            format!(
                r#"{{"role":"assistant","content":[{{"type":"text","text":"here\nMEDIA: {}"}}]}}"#,
                "media/out.png"
            ),
        );
        setup_session(dir.path(), "s1", &transcript);

        let media = match collect_transcript_media(dir.path(), "s1") {
            Ok(value) => value,
            Err(err) => panic!("collect failed: {err}"),
        };
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].file_name.as_deref(), Some("out.png"));
        assert_eq!(media[0].content_type, "image/png");
        let decoded = match BASE64.decode(&media[0].content_base64) {
            Ok(value) => value,
            Err(err) => panic!("decode failed: {err}"),
        };
        assert_eq!(decoded, b"\x89PNG fake");
    }

    #[test]
    fn caps_attachment_count() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("temp dir failed: {err}"),
        };
        let mut lines = Vec::new();
        for index in 0..6 {
            let path = dir.path().join(format!("f{index}.txt"));
            if let Err(err) = std::fs::write(&path, format!("file {index}")) {
                panic!("write failed: {err}");
            }
            lines.push(format!("MEDIA: f{index}.txt"));
        }
        let transcript = format!(
            r#"{{"role":"assistant","content":"{}"}}"#,
            lines.join("\\n")
        );
        setup_session(dir.path(), "s2", &format!("{transcript}\n"));

        let media = match collect_transcript_media(dir.path(), "s2") {
            Ok(value) => value,
            Err(err) => panic!("collect failed: {err}"),
        };
        assert_eq!(media.len(), MAX_MEDIA_FILES);
    }

    #[test]
    fn skips_oversized_files_and_bad_paths() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("temp dir failed: {err}"),
        };
        let big_path = dir.path().join("big.bin");
        let file = match std::fs::File::create(&big_path) {
            Ok(value) => value,
            Err(err) => panic!("create failed: {err}"),
        };
        if let Err(err) = file.set_len(MAX_MEDIA_FILE_BYTES + 1) {
            panic!("set_len failed: {err}");
        }
        let ok_path = dir.path().join("ok.txt");
        if let Err(err) = std::fs::write(&ok_path, "ok") {
            panic!("write failed: {err}");
        }

        let transcript = r#"{"role":"assistant","content":"MEDIA: big.bin\nMEDIA: ../escape.txt\nMEDIA: ok.txt"}"#;
        setup_session(dir.path(), "s3", &format!("{transcript}\n"));

        let media = match collect_transcript_media(dir.path(), "s3") {
            Ok(value) => value,
            Err(err) => panic!("collect failed: {err}"),
        };
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].file_name.as_deref(), Some("ok.txt"));
    }

    #[test]
    fn unknown_session_yields_no_media() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("temp dir failed: {err}"),
        };
        let media = match collect_transcript_media(dir.path(), "ghost") {
            Ok(value) => value,
            Err(err) => panic!("collect failed: {err}"),
        };
        assert!(media.is_empty());
    }
}
