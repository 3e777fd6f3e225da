//! Per-message chat protocol: idempotent send, a waiter for the terminal
//! `chat` event, bounded retries with retryability classification,
//! best-effort abort on timeout, and the usage-snapshot discipline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;

use common::protocol::{
    ChatEvent, ChatState, EVENT_CHAT, METHOD_CHAT_ABORT, METHOD_CHAT_SEND, METHOD_SESSIONS_USAGE,
};
use common::time::{clamp_timer_ms, now_ms};
use common::types::{ChatRunResult, MediaItem, OutboundMedia, RelayErrorCode};
use resilience::BackoffSchedule;

use crate::client::{GatewayEventMessage, GatewayHandle};
use crate::transcribe::Transcriber;
use crate::{media, sessions, uploads};

#[derive(Clone, Debug)]
pub struct ChatRunnerConfig {
    pub state_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub retry_attempts: u32,
    pub retry_base_delays_ms: Vec<u64>,
    pub retry_jitter_ms: u64,
    pub usage_timeout_ms: u64,
    pub abort_timeout_ms: u64,
    /// Below this much remaining budget no further attempt is started.
    pub min_slack_ms: u64,
}

impl ChatRunnerConfig {
    pub fn new(state_dir: PathBuf) -> Self {
        let workspace_root = state_dir.join("workspace");
        Self {
            state_dir,
            workspace_root,
            retry_attempts: 3,
            retry_base_delays_ms: vec![500, 2_000, 5_000],
            retry_jitter_ms: 250,
            usage_timeout_ms: 10_000,
            abort_timeout_ms: 5_000,
            min_slack_ms: 500,
        }
    }
}

/// Raw usage snapshots captured around one chat run; the processor turns
/// them into a canonical delta.
#[derive(Clone, Debug, Default)]
pub struct RunnerMeta {
    pub usage_incoming: Option<Value>,
    pub usage_outgoing: Option<Value>,
}

struct Waiter {
    session_key: String,
    tx: oneshot::Sender<ChatEvent>,
}

pub struct ChatRunner {
    gateway: Arc<dyn GatewayHandle>,
    transcriber: Option<Arc<dyn Transcriber>>,
    config: ChatRunnerConfig,
    backoff: BackoffSchedule,
    waiters: Mutex<HashMap<String, Waiter>>,
    run_sessions: Mutex<HashMap<String, String>>,
    /// Single-slot lock serializing `start_new_session_for_all` against
    /// the start of new chat tasks. FIFO by arrival (tokio mutex).
    maintenance: tokio::sync::Mutex<()>,
}

impl ChatRunner {
    pub fn new(
        gateway: Arc<dyn GatewayHandle>,
        transcriber: Option<Arc<dyn Transcriber>>,
        config: ChatRunnerConfig,
    ) -> Self {
        let backoff = BackoffSchedule::new(
            config.retry_base_delays_ms.clone(),
            config.retry_jitter_ms,
        );
        Self {
            gateway,
            transcriber,
            config,
            backoff,
            waiters: Mutex::new(HashMap::new()),
            run_sessions: Mutex::new(HashMap::new()),
            maintenance: tokio::sync::Mutex::new(()),
        }
    }

    /// Event sink wired into the Gateway client. Terminal `chat` events
    /// resolve their waiter; everything else is ignored here.
    pub fn handle_event(&self, event: &GatewayEventMessage) {
        if event.event != EVENT_CHAT {
            return;
        }
        let Some(payload) = &event.payload else {
            return;
        };
        let chat: ChatEvent = match serde_json::from_value(payload.clone()) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!("undecodable chat event dropped: {err}");
                return;
            }
        };
        if !chat.state.is_terminal() {
            return;
        }
        let waiter = lock(&self.waiters).remove(&chat.run_id);
        lock(&self.run_sessions).remove(&chat.run_id);
        match waiter {
            Some(waiter) => {
                // The waiter sees only this first terminal event; a second
                // one for the same run finds no entry and is dropped.
                let _ = waiter.tx.send(chat);
            }
            None => {
                tracing::debug!(run_id = %chat.run_id, "terminal chat event with no waiter dropped");
            }
        }
    }

    pub fn waiter_count(&self) -> usize {
        lock(&self.waiters).len()
    }

    pub fn has_waiter(&self, run_id: &str) -> bool {
        lock(&self.waiters).contains_key(run_id)
    }

    /// Drive one inbound chat message to a terminal outcome within
    /// `timeout_ms`. Never panics and never hangs past the deadline; the
    /// result is always one of reply / no_reply / error.
    pub async fn run_chat_task(
        &self,
        task_id: &str,
        session_key: &str,
        message_text: &str,
        media_items: &[MediaItem],
        timeout_ms: u64,
    ) -> (ChatRunResult, RunnerMeta) {
        // New tasks wait out any session maintenance in progress.
        {
            let _gate = self.maintenance.lock().await;
        }

        let mut meta = RunnerMeta::default();
        let deadline = now_ms().saturating_add(clamp_timer_ms(timeout_ms));

        let message = self.prepare_message(message_text, media_items).await;

        match self.session_usage(session_key).await {
            Ok(snapshot) => meta.usage_incoming = Some(snapshot),
            Err(err) => {
                return (
                    ChatRunResult::Error {
                        code: RelayErrorCode::UsageRequired,
                        message: format!("usage snapshot before send failed: {err}"),
                        run_id: None,
                    },
                    meta,
                );
            }
        }

        let mut last_run_id: Option<String> = None;
        for attempt in 1..=self.config.retry_attempts {
            let remaining = deadline.saturating_sub(now_ms());
            if remaining < self.config.min_slack_ms {
                return (self.timeout_result(timeout_ms, last_run_id), meta);
            }

            let params = json!({
                "sessionKey": session_key,
                "message": message,
                "idempotencyKey": task_id,
                "timeoutMs": remaining,
            });
            let payload = match self
                .gateway
                .request(METHOD_CHAT_SEND, params, Some(remaining))
                .await
            {
                Ok(payload) => payload,
                Err(err) => {
                    if err.is_retryable()
                        && attempt < self.config.retry_attempts
                        && self.retry_fits(attempt, deadline)
                    {
                        tracing::debug!(attempt, "chat.send failed, retrying: {err}");
                        self.sleep_backoff(attempt).await;
                        continue;
                    }
                    return (self.send_error_result(err, timeout_ms, last_run_id), meta);
                }
            };

            let Some(run_id) = payload
                .get("runId")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                return (
                    ChatRunResult::Error {
                        code: RelayErrorCode::NoRunId,
                        message: "chat.send response missing runId".to_string(),
                        run_id: None,
                    },
                    meta,
                );
            };
            last_run_id = Some(run_id.clone());

            let (tx, rx) = oneshot::channel();
            lock(&self.waiters).insert(
                run_id.clone(),
                Waiter {
                    session_key: session_key.to_string(),
                    tx,
                },
            );
            lock(&self.run_sessions).insert(run_id.clone(), session_key.to_string());

            let wait_ms = deadline.saturating_sub(now_ms()).max(1);
            match tokio::time::timeout(Duration::from_millis(wait_ms), rx).await {
                Ok(Ok(event)) => match event.state {
                    ChatState::Final => {
                        let result = match event.message {
                            Some(message_payload) if !message_payload.is_null() => {
                                ChatRunResult::Reply {
                                    message: message_payload,
                                    run_id: run_id.clone(),
                                    media: self.collect_reply_media(session_key),
                                }
                            }
                            _ => ChatRunResult::NoReply {
                                run_id: run_id.clone(),
                            },
                        };
                        match self.session_usage(session_key).await {
                            Ok(snapshot) => meta.usage_outgoing = Some(snapshot),
                            Err(err) => {
                                return (
                                    ChatRunResult::Error {
                                        code: RelayErrorCode::UsageRequired,
                                        message: format!(
                                            "usage snapshot after reply failed: {err}"
                                        ),
                                        run_id: Some(run_id),
                                    },
                                    meta,
                                );
                            }
                        }
                        return (result, meta);
                    }
                    ChatState::Aborted => {
                        return (
                            ChatRunResult::Error {
                                code: RelayErrorCode::Aborted,
                                message: "chat run aborted".to_string(),
                                run_id: Some(run_id),
                            },
                            meta,
                        );
                    }
                    ChatState::Error => {
                        let text = event
                            .error_message
                            .unwrap_or_else(|| "gateway reported an error".to_string());
                        if is_retryable_error_text(&text)
                            && attempt < self.config.retry_attempts
                            && self.retry_fits(attempt, deadline)
                        {
                            tracing::debug!(attempt, run_id, "retryable chat error: {text}");
                            self.sleep_backoff(attempt).await;
                            continue;
                        }
                        return (
                            ChatRunResult::Error {
                                code: RelayErrorCode::GatewayError,
                                message: text,
                                run_id: Some(run_id),
                            },
                            meta,
                        );
                    }
                    ChatState::Delta | ChatState::Other => {
                        return (
                            ChatRunResult::Error {
                                code: RelayErrorCode::RelayInternalError,
                                message: "non-terminal event delivered to waiter".to_string(),
                                run_id: Some(run_id),
                            },
                            meta,
                        );
                    }
                },
                Ok(Err(_)) => {
                    return (
                        ChatRunResult::Error {
                            code: RelayErrorCode::RelayInternalError,
                            message: "terminal event waiter cancelled".to_string(),
                            run_id: Some(run_id),
                        },
                        meta,
                    );
                }
                Err(_) => {
                    lock(&self.waiters).remove(&run_id);
                    lock(&self.run_sessions).remove(&run_id);
                    self.abort_run(session_key, &run_id).await;
                    if attempt < self.config.retry_attempts
                        && deadline.saturating_sub(now_ms()) >= self.config.min_slack_ms
                    {
                        tracing::debug!(attempt, run_id, "terminal wait timed out, retrying");
                        continue;
                    }
                    return (self.timeout_result(timeout_ms, Some(run_id)), meta);
                }
            }
        }

        (self.timeout_result(timeout_ms, last_run_id), meta)
    }

    /// Abort every in-flight run, then send `/new` to every session the
    /// Gateway knows about. Chat tasks arriving while this holds the
    /// maintenance lock wait for it. Returns `(rotated, failed)`.
    pub async fn start_new_session_for_all(&self) -> (usize, usize) {
        let _guard = self.maintenance.lock().await;

        let outstanding: Vec<(String, String)> = lock(&self.run_sessions)
            .iter()
            .map(|(run_id, session_key)| (run_id.clone(), session_key.clone()))
            .collect();
        for (run_id, session_key) in outstanding {
            self.abort_run(&session_key, &run_id).await;
        }

        let keys = match sessions::list_session_keys(&self.config.state_dir) {
            Ok(keys) => keys,
            Err(err) => {
                tracing::warn!("session enumeration failed: {err}");
                return (0, 0);
            }
        };

        let mut rotated = 0;
        let mut failed = 0;
        for key in keys {
            let params = json!({
                "sessionKey": key,
                "message": "/new",
                "idempotencyKey": Uuid::new_v4().to_string(),
                "timeoutMs": self.config.usage_timeout_ms,
            });
            match self
                .gateway
                .request(METHOD_CHAT_SEND, params, Some(self.config.usage_timeout_ms))
                .await
            {
                Ok(_) => rotated += 1,
                Err(err) => {
                    failed += 1;
                    tracing::warn!(session_key = %key, "session rotation failed: {err}");
                }
            }
        }
        tracing::info!(rotated, failed, "session rotation finished");
        (rotated, failed)
    }

    async fn prepare_message(&self, message_text: &str, media_items: &[MediaItem]) -> String {
        let mut message = message_text.to_string();

        if let Some(transcriber) = &self.transcriber {
            let audio = media_items
                .iter()
                .find(|item| matches!(item, MediaItem::Audio { .. }));
            if let Some(audio) = audio {
                match transcriber.transcribe(audio).await {
                    Ok(transcript) => {
                        message = if message.trim().is_empty() {
                            transcript
                        } else {
                            format!("{transcript}\n\n{message}")
                        };
                    }
                    Err(err) => {
                        tracing::warn!("transcription failed, keeping original message: {err}");
                    }
                }
            }
        }

        match uploads::stage_file_media(&self.config.workspace_root, media_items) {
            Ok(paths) => {
                for path in paths {
                    message.push_str(&format!("\nFile uploaded to: {}", path.display()));
                }
            }
            Err(err) => {
                tracing::warn!("file staging failed: {err}");
            }
        }

        message
    }

    async fn session_usage(
        &self,
        session_key: &str,
    ) -> Result<Value, crate::error::GatewayError> {
        self.gateway
            .request(
                METHOD_SESSIONS_USAGE,
                json!({"sessionKey": session_key}),
                Some(self.config.usage_timeout_ms),
            )
            .await
    }

    async fn abort_run(&self, session_key: &str, run_id: &str) {
        let params = json!({"sessionKey": session_key, "runId": run_id});
        if let Err(err) = self
            .gateway
            .request(METHOD_CHAT_ABORT, params, Some(self.config.abort_timeout_ms))
            .await
        {
            tracing::warn!(run_id, "chat.abort failed: {err}");
        }
    }

    fn collect_reply_media(&self, session_key: &str) -> Vec<OutboundMedia> {
        match media::collect_transcript_media(&self.config.state_dir, session_key) {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(session_key, "transcript media scrape failed: {err}");
                Vec::new()
            }
        }
    }

    fn retry_fits(&self, attempt: u32, deadline_ms: u64) -> bool {
        let remaining = deadline_ms.saturating_sub(now_ms());
        let worst_case_delay = self.backoff.max_delay_ms((attempt - 1) as usize);
        remaining > worst_case_delay.saturating_add(self.config.min_slack_ms)
    }

    async fn sleep_backoff(&self, attempt: u32) {
        tokio::time::sleep(self.backoff.delay_for((attempt - 1) as usize)).await;
    }

    fn timeout_result(&self, timeout_ms: u64, run_id: Option<String>) -> ChatRunResult {
        ChatRunResult::Error {
            code: RelayErrorCode::GatewayTimeout,
            message: format!("no terminal event within {timeout_ms} ms"),
            run_id,
        }
    }

    fn send_error_result(
        &self,
        err: crate::error::GatewayError,
        timeout_ms: u64,
        run_id: Option<String>,
    ) -> ChatRunResult {
        match err {
            crate::error::GatewayError::Timeout { .. } => self.timeout_result(timeout_ms, run_id),
            other => ChatRunResult::Error {
                code: RelayErrorCode::GatewayError,
                message: other.to_string(),
                run_id,
            },
        }
    }

    #[cfg(test)]
    fn track_run(&self, run_id: &str, session_key: &str) {
        lock(&self.run_sessions).insert(run_id.to_string(), session_key.to_string());
    }

    #[cfg(test)]
    fn session_for_run(&self, run_id: &str) -> Option<String> {
        lock(&self.run_sessions).get(run_id).cloned()
    }
}

/// Classify a terminal gateway error message. Embedded upstream JSON with
/// an HTTP-like code of 429 or 5xx, or `status: "INTERNAL"`, is transient;
/// when nothing parses, a textual scan for the same markers decides.
pub fn is_retryable_error_text(text: &str) -> bool {
    if let Some(start) = text.find('{') {
        if let Ok(value) = serde_json::from_str::<Value>(&text[start..]) {
            let error = value.get("error").unwrap_or(&value);
            if let Some(code) = numeric_code(error.get("code")) {
                if code == 429 || (500..=599).contains(&code) {
                    return true;
                }
            }
            if error.get("status").and_then(Value::as_str) == Some("INTERNAL") {
                return true;
            }
            if error.get("code").is_some() || error.get("status").is_some() {
                return false;
            }
        }
    }
    text.contains(r#""status":"INTERNAL""#)
        || text.contains(r#"status: "INTERNAL""#)
        || contains_code_5xx(text)
}

fn numeric_code(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if let Some(code) = value.as_u64() {
        return Some(code);
    }
    value.as_str().and_then(|raw| raw.parse().ok())
}

fn contains_code_5xx(text: &str) -> bool {
    let mut search = text;
    while let Some(pos) = search.find("code") {
        let rest = &search[pos + 4..];
        let rest = rest.strip_prefix('"').unwrap_or(rest);
        let rest = rest.trim_start();
        if let Some(rest) = rest.strip_prefix(':') {
            let rest = rest.trim_start();
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            if digits.len() == 3 && digits.starts_with('5') {
                return true;
            }
        }
        search = &search[pos + 4..];
    }
    false
}

fn lock<'a, K, V>(mutex: &'a Mutex<HashMap<K, V>>) -> MutexGuard<'a, HashMap<K, V>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "runner_test.rs"]
mod runner_test;
