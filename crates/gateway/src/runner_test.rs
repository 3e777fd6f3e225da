use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use common::protocol::HelloOk;
use common::types::{ChatRunResult, MediaItem, RelayErrorCode};

use super::{is_retryable_error_text, ChatRunner, ChatRunnerConfig};
use crate::client::{GatewayEventMessage, GatewayHandle};
use crate::error::GatewayError;

#[derive(Default)]
struct MockGateway {
    chat_send: Mutex<VecDeque<Result<Value, GatewayError>>>,
    usage: Mutex<VecDeque<Result<Value, GatewayError>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockGateway {
    fn push_chat_send(&self, result: Result<Value, GatewayError>) {
        self.chat_send.lock().expect("lock").push_back(result);
    }

    fn push_usage(&self, result: Result<Value, GatewayError>) {
        self.usage.lock().expect("lock").push_back(result);
    }

    fn calls_for(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }
}

#[async_trait]
impl GatewayHandle for MockGateway {
    async fn request(
        &self,
        method: &str,
        params: Value,
        _timeout_ms: Option<u64>,
    ) -> Result<Value, GatewayError> {
        self.calls
            .lock()
            .expect("lock")
            .push((method.to_string(), params));
        match method {
            "chat.send" => self
                .chat_send
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"runId": "run-default"}))),
            "sessions.usage" => self
                .usage
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"totals": {"input": 0, "output": 0}}))),
            "chat.abort" => Ok(Value::Null),
            other => Err(GatewayError::Remote {
                code: "UNKNOWN_METHOD".to_string(),
                message: format!("unexpected method {other}"),
                retryable: None,
            }),
        }
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn hello(&self) -> Option<HelloOk> {
        None
    }
}

fn quick_config(state_dir: std::path::PathBuf) -> ChatRunnerConfig {
    let mut config = ChatRunnerConfig::new(state_dir);
    config.retry_attempts = 3;
    config.retry_base_delays_ms = vec![5];
    config.retry_jitter_ms = 0;
    config.min_slack_ms = 50;
    config.abort_timeout_ms = 200;
    config.usage_timeout_ms = 200;
    config
}

fn runner_with(gateway: Arc<MockGateway>) -> (ChatRunner, tempfile::TempDir) {
    let dir = match tempfile::tempdir() {
        Ok(value) => value,
        Err(err) => panic!("temp dir failed: {err}"),
    };
    let runner = ChatRunner::new(gateway, None, quick_config(dir.path().to_path_buf()));
    (runner, dir)
}

fn chat_event(run_id: &str, state: &str, message: Option<Value>) -> GatewayEventMessage {
    let mut payload = json!({"runId": run_id, "state": state});
    if let Some(message) = message {
        payload["message"] = message;
    }
    GatewayEventMessage {
        event: "chat".to_string(),
        payload: Some(payload),
        seq: None,
    }
}

fn error_event(run_id: &str, error_message: &str) -> GatewayEventMessage {
    GatewayEventMessage {
        event: "chat".to_string(),
        payload: Some(json!({
            "runId": run_id,
            "state": "error",
            "errorMessage": error_message,
        })),
        seq: None,
    }
}

/// Deliver `event` once the runner has registered a waiter for `run_id`.
fn deliver_when_waiting(runner: &Arc<ChatRunner>, run_id: &str, event: GatewayEventMessage) {
    let runner = runner.clone();
    let run_id = run_id.to_string();
    tokio::spawn(async move {
        for _ in 0..500 {
            if runner.has_waiter(&run_id) {
                runner.handle_event(&event);
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("waiter for {run_id} never appeared");
    });
}

#[tokio::test]
async fn happy_chat_returns_reply_with_usage() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"runId": "r1"})));
    let (runner, _dir) = runner_with(gateway.clone());
    let runner = Arc::new(runner);

    deliver_when_waiting(
        &runner,
        "r1",
        chat_event("r1", "final", Some(json!({"text": "ok"}))),
    );

    let (result, meta) = runner
        .run_chat_task("m1", "s1", "hi", &[], 5_000)
        .await;

    match result {
        ChatRunResult::Reply {
            message, run_id, ..
        } => {
            assert_eq!(run_id, "r1");
            assert_eq!(message["text"], "ok");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(meta.usage_incoming.is_some());
    assert!(meta.usage_outgoing.is_some());

    let sends = gateway.calls_for("chat.send");
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0]["idempotencyKey"], "m1");
    assert_eq!(sends[0]["sessionKey"], "s1");
    assert_eq!(runner.waiter_count(), 0);
}

#[tokio::test]
async fn final_without_message_is_no_reply() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"runId": "r2"})));
    let (runner, _dir) = runner_with(gateway);
    let runner = Arc::new(runner);

    deliver_when_waiting(&runner, "r2", chat_event("r2", "final", None));

    let (result, _meta) = runner.run_chat_task("m2", "s1", "hi", &[], 5_000).await;
    assert_eq!(
        result,
        ChatRunResult::NoReply {
            run_id: "r2".to_string()
        }
    );
}

#[tokio::test]
async fn retryable_upstream_error_retries_with_same_idempotency_key() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"runId": "r2"})));
    gateway.push_chat_send(Ok(json!({"runId": "r3"})));
    let (runner, _dir) = runner_with(gateway.clone());
    let runner = Arc::new(runner);

    let injected = "JSON error injected into SSE stream\n{\"error\":{\"code\":500,\"status\":\"INTERNAL\"}}";
    deliver_when_waiting(&runner, "r2", error_event("r2", injected));
    deliver_when_waiting(
        &runner,
        "r3",
        chat_event("r3", "final", Some(json!({"text": "recovered"}))),
    );

    let (result, _meta) = runner.run_chat_task("m3", "s1", "hi", &[], 10_000).await;
    match result {
        ChatRunResult::Reply { run_id, .. } => assert_eq!(run_id, "r3"),
        other => panic!("unexpected result: {other:?}"),
    }

    let sends = gateway.calls_for("chat.send");
    assert_eq!(sends.len(), 2);
    assert_eq!(sends[0]["idempotencyKey"], "m3");
    assert_eq!(sends[1]["idempotencyKey"], "m3");
}

#[tokio::test]
async fn non_retryable_error_surfaces_verbatim() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"runId": "r5"})));
    let (runner, _dir) = runner_with(gateway.clone());
    let runner = Arc::new(runner);

    deliver_when_waiting(&runner, "r5", error_event("r5", "model refused: bad input"));

    let (result, _meta) = runner.run_chat_task("m5", "s1", "hi", &[], 5_000).await;
    match result {
        ChatRunResult::Error {
            code,
            message,
            run_id,
        } => {
            assert_eq!(code, RelayErrorCode::GatewayError);
            assert_eq!(message, "model refused: bad input");
            assert_eq!(run_id.as_deref(), Some("r5"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(gateway.calls_for("chat.send").len(), 1);
}

#[tokio::test]
async fn timeout_aborts_run_and_reports_gateway_timeout() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"runId": "r4"})));
    let (runner, _dir) = {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("temp dir failed: {err}"),
        };
        let mut config = quick_config(dir.path().to_path_buf());
        config.retry_attempts = 1;
        (
            ChatRunner::new(gateway.clone(), None, config),
            dir,
        )
    };
    let runner = Arc::new(runner);

    // No terminal event ever arrives.
    let (result, _meta) = runner.run_chat_task("m4", "s1", "hi", &[], 400).await;
    match result {
        ChatRunResult::Error { code, run_id, .. } => {
            assert_eq!(code, RelayErrorCode::GatewayTimeout);
            assert_eq!(run_id.as_deref(), Some("r4"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let aborts = gateway.calls_for("chat.abort");
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0]["runId"], "r4");
    assert_eq!(aborts[0]["sessionKey"], "s1");
    assert_eq!(runner.waiter_count(), 0);
}

#[tokio::test]
async fn aborted_terminal_event_maps_to_aborted() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"runId": "r6"})));
    let (runner, _dir) = runner_with(gateway);
    let runner = Arc::new(runner);

    deliver_when_waiting(&runner, "r6", chat_event("r6", "aborted", None));

    let (result, _meta) = runner.run_chat_task("m6", "s1", "hi", &[], 5_000).await;
    match result {
        ChatRunResult::Error { code, .. } => assert_eq!(code, RelayErrorCode::Aborted),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn missing_run_id_fails_without_waiting() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"accepted": true})));
    let (runner, _dir) = runner_with(gateway);

    let (result, _meta) = runner.run_chat_task("m7", "s1", "hi", &[], 5_000).await;
    match result {
        ChatRunResult::Error { code, .. } => assert_eq!(code, RelayErrorCode::NoRunId),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(runner.waiter_count(), 0);
}

#[tokio::test]
async fn missing_pre_usage_snapshot_blocks_send() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_usage(Err(GatewayError::Timeout { timeout_ms: 200 }));
    let (runner, _dir) = runner_with(gateway.clone());

    let (result, meta) = runner.run_chat_task("m8", "s1", "hi", &[], 5_000).await;
    match result {
        ChatRunResult::Error { code, .. } => assert_eq!(code, RelayErrorCode::UsageRequired),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(meta.usage_incoming.is_none());
    assert!(gateway.calls_for("chat.send").is_empty());
}

#[tokio::test]
async fn missing_post_usage_snapshot_fails_the_run() {
    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"runId": "r9"})));
    gateway.push_usage(Ok(json!({"totals": {"input": 5}})));
    gateway.push_usage(Err(GatewayError::Timeout { timeout_ms: 200 }));
    let (runner, _dir) = runner_with(gateway);
    let runner = Arc::new(runner);

    deliver_when_waiting(
        &runner,
        "r9",
        chat_event("r9", "final", Some(json!({"text": "ok"}))),
    );

    let (result, meta) = runner.run_chat_task("m9", "s1", "hi", &[], 5_000).await;
    match result {
        ChatRunResult::Error { code, run_id, .. } => {
            assert_eq!(code, RelayErrorCode::UsageRequired);
            assert_eq!(run_id.as_deref(), Some("r9"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(meta.usage_incoming.is_some());
    assert!(meta.usage_outgoing.is_none());
}

#[tokio::test]
async fn tiny_budget_times_out_before_any_send() {
    let gateway = Arc::new(MockGateway::default());
    let (runner, _dir) = runner_with(gateway.clone());

    let (result, _meta) = runner.run_chat_task("m10", "s1", "hi", &[], 10).await;
    match result {
        ChatRunResult::Error { code, .. } => assert_eq!(code, RelayErrorCode::GatewayTimeout),
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(gateway.calls_for("chat.send").is_empty());
}

#[tokio::test]
async fn unknown_run_id_terminal_event_is_dropped() {
    let gateway = Arc::new(MockGateway::default());
    let (runner, _dir) = runner_with(gateway);

    runner.handle_event(&chat_event("ghost", "final", Some(json!({"text": "?"}))));
    assert_eq!(runner.waiter_count(), 0);
}

#[tokio::test]
async fn session_rotation_aborts_runs_and_counts_outcomes() {
    let gateway = Arc::new(MockGateway::default());
    // alpha rotates, beta fails.
    gateway.push_chat_send(Ok(json!({"runId": "rot-1"})));
    gateway.push_chat_send(Err(GatewayError::Remote {
        code: "SESSION_BUSY".to_string(),
        message: "cannot rotate".to_string(),
        retryable: None,
    }));

    let dir = match tempfile::tempdir() {
        Ok(value) => value,
        Err(err) => panic!("temp dir failed: {err}"),
    };
    let sessions_dir = dir.path().join("agents/main/sessions");
    if let Err(err) = std::fs::create_dir_all(&sessions_dir) {
        panic!("create sessions dir failed: {err}");
    }
    let map = r#"{
        "agent:main:alpha": {"sessionFile": "alpha.jsonl"},
        "agent:main:beta": {"sessionFile": "beta.jsonl"}
    }"#;
    if let Err(err) = std::fs::write(sessions_dir.join("sessions.json"), map) {
        panic!("write sessions map failed: {err}");
    }

    let runner = ChatRunner::new(
        gateway.clone(),
        None,
        quick_config(dir.path().to_path_buf()),
    );
    runner.track_run("r-live", "alpha");

    let (rotated, failed) = runner.start_new_session_for_all().await;
    assert_eq!(rotated, 1);
    assert_eq!(failed, 1);

    let aborts = gateway.calls_for("chat.abort");
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0]["runId"], "r-live");

    let sends = gateway.calls_for("chat.send");
    assert_eq!(sends.len(), 2);
    assert!(sends.iter().all(|params| params["message"] == "/new"));
    // Rotation keys are independent of any inbound message id.
    assert_ne!(sends[0]["idempotencyKey"], sends[1]["idempotencyKey"]);
    assert!(runner.session_for_run("r-live").is_some());
}

#[tokio::test]
async fn file_media_paths_are_appended_to_the_message() {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let gateway = Arc::new(MockGateway::default());
    gateway.push_chat_send(Ok(json!({"runId": "r11"})));
    let (runner, _dir) = runner_with(gateway.clone());
    let runner = Arc::new(runner);

    deliver_when_waiting(&runner, "r11", chat_event("r11", "final", None));

    let media = vec![MediaItem::File {
        file_name: Some("notes.txt".to_string()),
        content_base64: BASE64.encode(b"hello"),
    }];
    let (result, _meta) = runner
        .run_chat_task("m11", "s1", "see attachment", &media, 5_000)
        .await;
    assert!(matches!(result, ChatRunResult::NoReply { .. }));

    let sends = gateway.calls_for("chat.send");
    let message = sends[0]["message"].as_str().unwrap_or_default();
    assert!(message.starts_with("see attachment"));
    assert!(message.contains("\nFile uploaded to: "));
    assert!(message.contains("notes.txt"));
}

#[test]
fn error_text_classification() {
    // Embedded upstream JSON decides when it parses.
    assert!(is_retryable_error_text(
        "JSON error injected into SSE stream\n{\"error\":{\"code\":500,\"status\":\"INTERNAL\"}}"
    ));
    assert!(is_retryable_error_text("{\"error\":{\"code\":429}}"));
    assert!(is_retryable_error_text("{\"error\":{\"code\":\"503\"}}"));
    assert!(is_retryable_error_text(
        "{\"error\":{\"status\":\"INTERNAL\"}}"
    ));
    assert!(!is_retryable_error_text("{\"error\":{\"code\":400}}"));
    assert!(!is_retryable_error_text(
        "{\"error\":{\"status\":\"INVALID_ARGUMENT\"}}"
    ));

    // Textual heuristics when no JSON parses.
    assert!(is_retryable_error_text(
        "upstream said \"status\":\"INTERNAL\" and gave up"
    ));
    assert!(is_retryable_error_text("stream failed with \"code\": 502 {"));
    assert!(!is_retryable_error_text("model refused: bad input"));
    assert!(!is_retryable_error_text("\"code\": 404 not found"));
}
