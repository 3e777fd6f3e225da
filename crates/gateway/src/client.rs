//! Duplex correlated-frame client for the Gateway WebSocket.
//!
//! One connection epoch at a time: connect, handshake (optional
//! `connect.challenge`, then `connect` → `HelloOk`), then a single read
//! loop that correlates `res` frames to pending requests by id, routes
//! events to the registered handler, and feeds the tick watchdog. On any
//! close the hello is cleared first, every pending request is rejected,
//! and a supervisor reconnects with multiplicative backoff.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use common::protocol::{
    ErrorShape, Frame, HelloOk, EVENT_CONNECT_CHALLENGE, EVENT_TICK, MAX_PROTOCOL, METHOD_CONNECT,
    MIN_PROTOCOL,
};
use common::time::{clamp_timer_ms, now_ms};

use crate::error::GatewayError;
use crate::identity::{canonical_connect_payload, DeviceIdentity};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Private close code used when the tick watchdog recycles a dead peer.
pub const CLOSE_TICK_TIMEOUT: u16 = 4002;
/// Close code for a failed or invalid handshake.
const CLOSE_POLICY: u16 = 1008;

const CONNECT_ANYWAY_MS: u64 = 50;
const RECONNECT_INITIAL_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 30_000;
const RECONNECT_FACTOR: f64 = 1.5;

#[derive(Clone, Debug)]
pub struct GatewayClientConfig {
    pub ws_url: String,
    pub token: Option<String>,
    pub password: Option<String>,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub client_version: String,
    pub client_mode: String,
    pub instance_id: String,
    pub role: String,
    pub caps: Vec<String>,
    pub connect_timeout_ms: u64,
    pub default_request_timeout_ms: u64,
}

impl GatewayClientConfig {
    pub fn new(ws_url: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            token: None,
            password: None,
            scopes: vec!["operator.admin".to_string()],
            client_id: "clawrelay".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            client_mode: "relay".to_string(),
            instance_id: instance_id.into(),
            role: "operator".to_string(),
            caps: Vec::new(),
            connect_timeout_ms: 10_000,
            default_request_timeout_ms: 30_000,
        }
    }
}

/// A non-handshake, non-tick event delivered to the registered sink.
#[derive(Clone, Debug)]
pub struct GatewayEventMessage {
    pub event: String,
    pub payload: Option<Value>,
    pub seq: Option<u64>,
}

pub type EventHandler = Arc<dyn Fn(GatewayEventMessage) + Send + Sync>;

/// The surface the chat runner depends on; `GatewayClient` is the
/// production implementation, tests substitute mocks.
#[async_trait]
pub trait GatewayHandle: Send + Sync {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, GatewayError>;

    fn is_ready(&self) -> bool;

    fn hello(&self) -> Option<HelloOk>;
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Result<Value, GatewayError>>,
}

struct ClientShared {
    config: GatewayClientConfig,
    identity: Option<Arc<dyn DeviceIdentity>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    hello: RwLock<Option<HelloOk>>,
    event_handler: RwLock<Option<EventHandler>>,
    writer: tokio::sync::Mutex<Option<WsSink>>,
    last_tick_ms: AtomicU64,
    tick_seen: AtomicBool,
}

pub struct GatewayClient {
    shared: Arc<ClientShared>,
    lifecycle: Mutex<Option<watch::Sender<bool>>>,
}

impl GatewayClient {
    pub fn new(config: GatewayClientConfig, identity: Option<Arc<dyn DeviceIdentity>>) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                config,
                identity,
                pending: Mutex::new(HashMap::new()),
                hello: RwLock::new(None),
                event_handler: RwLock::new(None),
                writer: tokio::sync::Mutex::new(None),
                last_tick_ms: AtomicU64::new(0),
                tick_seen: AtomicBool::new(false),
            }),
            lifecycle: Mutex::new(None),
        }
    }

    /// Register the sink for non-handshake, non-tick events. The handler
    /// runs on the read loop, so it must not block.
    pub fn set_event_handler(&self, handler: EventHandler) {
        *write_lock(&self.shared.event_handler) = Some(handler);
    }

    /// Connect and handshake. Blocks until a `HelloOk` is published or the
    /// first attempt fails. Idempotent while running; reentrant after
    /// `stop()`. After a successful start, later disconnects reconnect in
    /// the background.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let stop_rx = {
            let mut guard = lock(&self.lifecycle);
            if guard.is_some() {
                return Ok(());
            }
            let (tx, rx) = watch::channel(false);
            *guard = Some(tx);
            rx
        };

        let (first_tx, first_rx) = oneshot::channel();
        let shared = self.shared.clone();
        tokio::spawn(supervise(shared, stop_rx, first_tx));

        match first_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                *lock(&self.lifecycle) = None;
                Err(err)
            }
            Err(_) => {
                *lock(&self.lifecycle) = None;
                Err(GatewayError::Handshake("connection task exited".to_string()))
            }
        }
    }

    /// Close the socket, reject every pending request, and cancel the
    /// reconnect supervisor and tick watchdog.
    pub async fn stop(&self) {
        let sender = lock(&self.lifecycle).take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
        teardown(&self.shared, 1000, "client stopped").await;
    }

    pub fn is_ready(&self) -> bool {
        read_lock(&self.shared.hello).is_some()
    }

    pub fn hello(&self) -> Option<HelloOk> {
        read_lock(&self.shared.hello).clone()
    }

    /// Send a `req` frame and await the matching `res`.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, GatewayError> {
        request_shared(&self.shared, method, params, timeout_ms).await
    }
}

#[async_trait]
impl GatewayHandle for GatewayClient {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, GatewayError> {
        GatewayClient::request(self, method, params, timeout_ms).await
    }

    fn is_ready(&self) -> bool {
        GatewayClient::is_ready(self)
    }

    fn hello(&self) -> Option<HelloOk> {
        GatewayClient::hello(self)
    }
}

async fn request_shared(
    shared: &Arc<ClientShared>,
    method: &str,
    params: Value,
    timeout_ms: Option<u64>,
) -> Result<Value, GatewayError> {
    if read_lock(&shared.hello).is_none() {
        return Err(GatewayError::NotConnected);
    }

    let id = Uuid::new_v4().to_string();
    let (tx, rx) = oneshot::channel();
    lock(&shared.pending).insert(
        id.clone(),
        PendingRequest {
            method: method.to_string(),
            tx,
        },
    );

    let frame = Frame::Req {
        id: id.clone(),
        method: method.to_string(),
        params: Some(params),
    };
    if let Err(err) = send_frame(shared, &frame).await {
        lock(&shared.pending).remove(&id);
        return Err(err);
    }

    let timeout_ms = clamp_timer_ms(timeout_ms.unwrap_or(shared.config.default_request_timeout_ms));
    match tokio::time::timeout(Duration::from_millis(timeout_ms.max(1)), rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(GatewayError::Closed {
            code: 1006,
            reason: "connection reset".to_string(),
        }),
        Err(_) => {
            lock(&shared.pending).remove(&id);
            Err(GatewayError::Timeout { timeout_ms })
        }
    }
}

enum ConnectionRun {
    Stopped,
    ClosedAfterHello,
    FailedBeforeHello(GatewayError),
}

async fn supervise(
    shared: Arc<ClientShared>,
    mut stop_rx: watch::Receiver<bool>,
    first_tx: oneshot::Sender<Result<(), GatewayError>>,
) {
    let mut first = Some(first_tx);
    let mut backoff_ms = RECONNECT_INITIAL_MS;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        match run_connection(&shared, &mut stop_rx, &mut first).await {
            ConnectionRun::Stopped => break,
            ConnectionRun::ClosedAfterHello => {
                backoff_ms = RECONNECT_INITIAL_MS;
            }
            ConnectionRun::FailedBeforeHello(err) => {
                // A failed first attempt rejects start(); reconnecting is
                // then the caller's decision.
                if let Some(tx) = first.take() {
                    let _ = tx.send(Err(err));
                    return;
                }
                tracing::warn!("gateway reconnect failed: {err}");
            }
        }

        tracing::info!(delay_ms = backoff_ms, "gateway reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
            _ = stop_changed(&mut stop_rx) => break,
        }
        backoff_ms = ((backoff_ms as f64 * RECONNECT_FACTOR) as u64).min(RECONNECT_MAX_MS);
    }
}

async fn run_connection(
    shared: &Arc<ClientShared>,
    stop_rx: &mut watch::Receiver<bool>,
    first: &mut Option<oneshot::Sender<Result<(), GatewayError>>>,
) -> ConnectionRun {
    // The tungstenite defaults allow 64 MiB messages, which covers base64
    // media payloads.
    let connect = tokio::select! {
        result = connect_async(shared.config.ws_url.as_str()) => result,
        _ = stop_changed(stop_rx) => return ConnectionRun::Stopped,
    };
    let (ws, _response) = match connect {
        Ok(pair) => pair,
        Err(err) => {
            return ConnectionRun::FailedBeforeHello(GatewayError::Handshake(format!(
                "connect failed: {err}"
            )))
        }
    };
    let (sink, mut stream) = ws.split();
    {
        *shared.writer.lock().await = Some(sink);
    }

    let hello = match perform_handshake(shared, &mut stream, stop_rx).await {
        Ok(Some(hello)) => hello,
        Ok(None) => {
            teardown(shared, 1000, "client stopped").await;
            return ConnectionRun::Stopped;
        }
        Err(err) => {
            teardown(shared, CLOSE_POLICY, "handshake failed").await;
            return ConnectionRun::FailedBeforeHello(err);
        }
    };

    let tick_interval_ms = hello.policy.tick_interval_ms.max(1);
    {
        *write_lock(&shared.hello) = Some(hello.clone());
    }
    shared.tick_seen.store(false, Ordering::SeqCst);
    shared.last_tick_ms.store(now_ms(), Ordering::SeqCst);
    if let Some(tx) = first.take() {
        let _ = tx.send(Ok(()));
    }
    tracing::info!(
        protocol = hello.protocol,
        tick_interval_ms,
        "gateway connected"
    );

    let mut watchdog =
        tokio::time::interval(Duration::from_millis((tick_interval_ms / 2).max(1_000)));
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let (close_code, close_reason) = loop {
        tokio::select! {
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => route_text(shared, text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                            None => (1005, "closed without status".to_string()),
                        };
                        break (code, reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break (1006, format!("socket error: {err}")),
                    None => break (1006, "stream ended".to_string()),
                }
            }
            _ = watchdog.tick() => {
                if shared.tick_seen.load(Ordering::SeqCst) {
                    let last = shared.last_tick_ms.load(Ordering::SeqCst);
                    let silence = now_ms().saturating_sub(last);
                    if silence > tick_interval_ms.saturating_mul(2) {
                        tracing::warn!(silence_ms = silence, "tick watchdog expired, recycling connection");
                        break (CLOSE_TICK_TIMEOUT, "tick timeout".to_string());
                    }
                }
            }
            _ = stop_changed(stop_rx) => {
                teardown(shared, 1000, "client stopped").await;
                return ConnectionRun::Stopped;
            }
        }
    };

    tracing::warn!(code = close_code, reason = %close_reason, "gateway connection closed");
    teardown(shared, close_code, &close_reason).await;
    ConnectionRun::ClosedAfterHello
}

/// Wait for an optional `connect.challenge`, send `connect`, and await the
/// hello response. Returns `Ok(None)` when stop was requested mid-flight.
async fn perform_handshake(
    shared: &Arc<ClientShared>,
    stream: &mut WsStream,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<Option<HelloOk>, GatewayError> {
    let mut nonce: Option<String> = None;

    // Gateways that never challenge must not stall the handshake.
    let challenge_window = tokio::time::sleep(Duration::from_millis(CONNECT_ANYWAY_MS));
    tokio::pin!(challenge_window);
    loop {
        tokio::select! {
            _ = &mut challenge_window => break,
            _ = stop_changed(stop_rx) => return Ok(None),
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(Frame::Event { event, payload, .. }) = Frame::decode(text.as_str()) {
                            if event == EVENT_CONNECT_CHALLENGE {
                                nonce = payload
                                    .as_ref()
                                    .and_then(|payload| payload.get("nonce"))
                                    .and_then(Value::as_str)
                                    .map(str::to_string);
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(GatewayError::Handshake("closed before hello".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return Err(GatewayError::Handshake(format!("socket error: {err}")));
                    }
                }
            }
        }
    }

    let id = Uuid::new_v4().to_string();
    let frame = Frame::Req {
        id: id.clone(),
        method: METHOD_CONNECT.to_string(),
        params: Some(connect_params(shared, nonce.as_deref())),
    };
    send_frame(shared, &frame)
        .await
        .map_err(|err| GatewayError::Handshake(err.to_string()))?;

    let deadline = tokio::time::sleep(Duration::from_millis(clamp_timer_ms(
        shared.config.connect_timeout_ms,
    )));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(GatewayError::Handshake("connect timed out".to_string()));
            }
            _ = stop_changed(stop_rx) => return Ok(None),
            message = stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match Frame::decode(text.as_str()) {
                            Ok(Frame::Res { id: res_id, ok, payload, error }) if res_id == id => {
                                if !ok {
                                    let detail = error
                                        .map(|error| format!("{}: {}", error.code, error.message))
                                        .unwrap_or_else(|| "connect rejected".to_string());
                                    return Err(GatewayError::Handshake(detail));
                                }
                                let payload = payload.unwrap_or(Value::Null);
                                let hello: HelloOk = serde_json::from_value(payload).map_err(
                                    |err| GatewayError::Handshake(format!("invalid hello payload: {err}")),
                                )?;
                                return Ok(Some(hello));
                            }
                            Ok(Frame::Event { event, .. }) if event == EVENT_TICK => {
                                shared.last_tick_ms.store(now_ms(), Ordering::SeqCst);
                                shared.tick_seen.store(true, Ordering::SeqCst);
                            }
                            Ok(_) => {}
                            Err(err) => {
                                tracing::debug!("dropping malformed frame during handshake: {err}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(GatewayError::Handshake("closed before hello".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return Err(GatewayError::Handshake(format!("socket error: {err}")));
                    }
                }
            }
        }
    }
}

fn connect_params(shared: &ClientShared, nonce: Option<&str>) -> Value {
    let config = &shared.config;
    let scopes: Vec<String> = config
        .scopes
        .iter()
        .map(String::clone)
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();

    let mut params = json!({
        "minProtocol": MIN_PROTOCOL,
        "maxProtocol": MAX_PROTOCOL,
        "client": {
            "id": config.client_id,
            "version": config.client_version,
            "platform": std::env::consts::OS,
            "mode": config.client_mode,
            "instanceId": config.instance_id,
        },
        "role": config.role,
        "scopes": scopes,
        "caps": config.caps,
    });

    if config.token.is_some() || config.password.is_some() {
        let mut auth = serde_json::Map::new();
        if let Some(token) = &config.token {
            auth.insert("token".to_string(), json!(token));
        }
        if let Some(password) = &config.password {
            auth.insert("password".to_string(), json!(password));
        }
        params["auth"] = Value::Object(auth);
    }

    if let Some(identity) = &shared.identity {
        let signed_at = now_ms();
        let payload = canonical_connect_payload(
            identity.device_id(),
            &config.client_id,
            &config.client_mode,
            &config.role,
            &scopes,
            signed_at,
            config.token.as_deref(),
            nonce,
        );
        let mut device = json!({
            "id": identity.device_id(),
            "publicKey": identity.public_key(),
            "signature": identity.sign(&payload),
            "signedAt": signed_at,
        });
        if let Some(nonce) = nonce {
            device["nonce"] = json!(nonce);
        }
        params["device"] = device;
    }

    params
}

fn route_text(shared: &Arc<ClientShared>, text: &str) {
    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!("dropping malformed frame: {err}");
            return;
        }
    };
    match frame {
        Frame::Res {
            id,
            ok,
            payload,
            error,
        } => {
            let Some(pending) = lock(&shared.pending).remove(&id) else {
                tracing::debug!(id, "response for unknown request id dropped");
                return;
            };
            let result = if ok {
                Ok(payload.unwrap_or(Value::Null))
            } else {
                let error = error.unwrap_or(ErrorShape {
                    code: "UNKNOWN".to_string(),
                    message: "gateway returned ok=false".to_string(),
                    retryable: None,
                    retry_after_ms: None,
                });
                tracing::debug!(method = %pending.method, code = %error.code, "gateway request failed");
                Err(GatewayError::Remote {
                    code: error.code,
                    message: error.message,
                    retryable: error.retryable,
                })
            };
            let _ = pending.tx.send(result);
        }
        Frame::Event {
            event,
            payload,
            seq,
        } => {
            if event == EVENT_TICK {
                shared.last_tick_ms.store(now_ms(), Ordering::SeqCst);
                shared.tick_seen.store(true, Ordering::SeqCst);
                return;
            }
            if event == EVENT_CONNECT_CHALLENGE {
                return;
            }
            let handler = read_lock(&shared.event_handler).clone();
            if let Some(handler) = handler {
                handler(GatewayEventMessage {
                    event,
                    payload,
                    seq,
                });
            }
        }
        Frame::Req { id, method, .. } => {
            tracing::debug!(id, method, "ignoring server-initiated request");
        }
    }
}

async fn send_frame(shared: &ClientShared, frame: &Frame) -> Result<(), GatewayError> {
    let text = frame
        .encode()
        .map_err(|err| GatewayError::Transport(err.to_string()))?;
    let mut writer = shared.writer.lock().await;
    let Some(sink) = writer.as_mut() else {
        return Err(GatewayError::NotConnected);
    };
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|err| GatewayError::Transport(format!("send failed: {err}")))
}

/// End the connection epoch: the hello is cleared BEFORE any pending is
/// rejected, so `is_ready()` can never observe a live hello alongside a
/// closed-connection error.
async fn teardown(shared: &Arc<ClientShared>, code: u16, reason: &str) {
    {
        *write_lock(&shared.hello) = None;
    }
    shared.tick_seen.store(false, Ordering::SeqCst);

    let drained: Vec<PendingRequest> = {
        let mut pending = lock(&shared.pending);
        pending.drain().map(|(_, value)| value).collect()
    };
    for request in drained {
        let _ = request.tx.send(Err(GatewayError::Closed {
            code,
            reason: reason.to_string(),
        }));
    }

    let mut writer = shared.writer.lock().await;
    if let Some(mut sink) = writer.take() {
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: code.into(),
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

async fn stop_changed(stop_rx: &mut watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        // A dropped sender counts as a stop request.
        if stop_rx.changed().await.is_err() {
            return;
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_lock<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockReadGuard<'a, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<'a, T>(lock: &'a RwLock<T>) -> std::sync::RwLockWriteGuard<'a, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;
