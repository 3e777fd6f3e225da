//! Reader for the Gateway's on-disk session store.
//!
//! `agents/main/sessions/sessions.json` maps `"agent:main:<sessionKey>"`
//! to `{ "sessionFile": <path> }`; the session file is a JSONL transcript.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

const SESSION_KEY_PREFIX: &str = "agent:main:";

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub session_file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
#[error("session store error: {message}")]
pub struct SessionStoreError {
    message: String,
}

impl SessionStoreError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

fn sessions_map_path(state_dir: &Path) -> PathBuf {
    state_dir.join("agents/main/sessions/sessions.json")
}

fn load_sessions_map(
    state_dir: &Path,
) -> Result<HashMap<String, SessionEntry>, SessionStoreError> {
    let path = sessions_map_path(state_dir);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(&path)
        .map_err(|err| SessionStoreError::new(format!("sessions map read failed: {err}")))?;
    serde_json::from_str(&raw)
        .map_err(|err| SessionStoreError::new(format!("sessions map decode failed: {err}")))
}

/// All session keys known to the Gateway, with the `agent:main:` prefix
/// stripped.
pub fn list_session_keys(state_dir: &Path) -> Result<Vec<String>, SessionStoreError> {
    let map = load_sessions_map(state_dir)?;
    let mut keys: Vec<String> = map
        .keys()
        .filter_map(|key| key.strip_prefix(SESSION_KEY_PREFIX))
        .map(str::to_string)
        .collect();
    keys.sort();
    Ok(keys)
}

/// Resolve the transcript file for a session key. Relative entries resolve
/// against the state dir.
pub fn session_file(
    state_dir: &Path,
    session_key: &str,
) -> Result<Option<PathBuf>, SessionStoreError> {
    let map = load_sessions_map(state_dir)?;
    let entry = map.get(&format!("{SESSION_KEY_PREFIX}{session_key}"));
    Ok(entry.map(|entry| {
        if entry.session_file.is_absolute() {
            entry.session_file.clone()
        } else {
            state_dir.join(&entry.session_file)
        }
    }))
}
