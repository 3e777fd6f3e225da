use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use common::config::RelayConfig;
use common::logging::{init_logging, LoggingConfig};
use gateway::client::{GatewayClient, GatewayClientConfig, GatewayHandle};
use gateway::runner::ChatRunnerConfig;
use gateway::transcribe::{HttpTranscriber, Transcriber};
use gateway::ChatRunner;
use relayd::backend::BackendClient;
use relayd::processor::RelayProcessor;
use relayd::push::{build_router, HealthReport, HealthSource, MessageSink, PushServerState};
use relayd::queue::WorkQueue;
use resilience::BackoffSchedule;

#[derive(Debug, thiserror::Error)]
#[error("relayd error: {message}")]
struct RelaydError {
    message: String,
}

impl RelaydError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), RelaydError> {
    let config = RelayConfig::from_env().map_err(|err| RelaydError::new(err.to_string()))?;
    init_logging(LoggingConfig {
        level: Default::default(),
        message_flow: config.message_flow_log,
    })
    .map_err(|err| RelaydError::new(err.to_string()))?;

    tracing::info!(instance_id = %config.instance_id, "relay starting");

    let mut client_config =
        GatewayClientConfig::new(config.gateway.ws_url.clone(), config.instance_id.clone());
    client_config.token = config.gateway.token.clone();
    client_config.password = config.gateway.password.clone();
    client_config.scopes = config.gateway.scopes.clone();
    let client = Arc::new(GatewayClient::new(client_config, None));

    let transcriber: Option<Arc<dyn Transcriber>> = match &config.stt {
        Some(stt) => match HttpTranscriber::new(stt.clone()) {
            Ok(transcriber) => Some(Arc::new(transcriber)),
            Err(err) => {
                tracing::warn!("transcriber init failed, audio stays untranscribed: {err}");
                None
            }
        },
        None => None,
    };

    let runner = Arc::new(ChatRunner::new(
        client.clone() as Arc<dyn GatewayHandle>,
        transcriber,
        ChatRunnerConfig::new(config.gateway.state_dir.clone()),
    ));
    {
        let runner = runner.clone();
        client.set_event_handler(Arc::new(move |event| runner.handle_event(&event)));
    }

    // A dead gateway at boot is not fatal; ingress readiness stays false
    // until a connect attempt lands.
    if let Err(err) = client.start().await {
        tracing::warn!("initial gateway connect failed, retrying in background: {err}");
        spawn_gateway_retry(client.clone());
    }

    let backend = Arc::new(
        BackendClient::new(config.backend_base_url.clone(), config.relay_token.clone())
            .map_err(|err| RelaydError::new(err.to_string()))?,
    );
    let processor = Arc::new(RelayProcessor::new(
        config.instance_id.clone(),
        client.clone() as Arc<dyn GatewayHandle>,
        runner.clone(),
        backend,
        config.task_timeout_ms,
    ));
    let queue = Arc::new(WorkQueue::new(
        config.concurrency,
        config.push.max_queue,
        processor,
    ));

    let shutting_down = Arc::new(AtomicBool::new(false));
    let health = Arc::new(RelayHealth {
        queue: queue.clone(),
        gateway: client.clone(),
        shutting_down: shutting_down.clone(),
    });

    let push_state = PushServerState::new(
        &config.push,
        config.relay_token.clone(),
        queue.clone() as Arc<dyn MessageSink>,
        health,
    );
    let app = build_router(&config.push, push_state);

    let addr = format!("0.0.0.0:{}", config.push.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| RelaydError::new(format!("bind failed: {err}")))?;
    tracing::info!(addr = %addr, path = %config.push.path, "push server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn({
        let mut rx = shutdown_rx;
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    loop {
                        if *rx.borrow() {
                            break;
                        }
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
                .map_err(|err| RelaydError::new(format!("server failed: {err}")))
        }
    });

    let server_result = tokio::select! {
        result = server_task => match result {
            Ok(inner) => inner,
            Err(err) => Err(RelaydError::new(format!("server task join failed: {err}"))),
        },
        signal = tokio::signal::ctrl_c() => {
            let _ = signal;
            tracing::info!("shutdown signal received");
            Ok(())
        }
    };

    // Shutdown order: readiness flips false, ingress closes, queued work
    // drains, then the gateway connection goes away.
    shutting_down.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(true);
    queue.stop_accepting();
    let drain_budget =
        Duration::from_millis(config.task_timeout_ms.saturating_mul(2).max(15_000));
    if !queue.drain(drain_budget).await {
        tracing::warn!("drain deadline elapsed with work still outstanding");
    }
    client.stop().await;
    tracing::info!("relay stopped");

    server_result
}

fn spawn_gateway_retry(client: Arc<GatewayClient>) {
    tokio::spawn(async move {
        let schedule = BackoffSchedule::new(vec![1_000, 2_000, 5_000, 10_000, 30_000], 500);
        let mut attempt = 0usize;
        loop {
            tokio::time::sleep(schedule.delay_for(attempt)).await;
            match client.start().await {
                Ok(()) => {
                    tracing::info!("gateway connected");
                    return;
                }
                Err(err) => tracing::warn!("gateway connect retry failed: {err}"),
            }
            attempt += 1;
        }
    });
}

struct RelayHealth {
    queue: Arc<WorkQueue>,
    gateway: Arc<GatewayClient>,
    shutting_down: Arc<AtomicBool>,
}

impl HealthSource for RelayHealth {
    fn health(&self) -> HealthReport {
        let state = self.queue.state();
        let gateway_ready = self.gateway.is_ready();
        let shutting_down = self.shutting_down.load(Ordering::SeqCst);
        let ready = !shutting_down && gateway_ready && state.queue_length < state.max_queue;
        HealthReport {
            ok: true,
            ready,
            details: Some(json!({
                "queueLength": state.queue_length,
                "inFlight": state.in_flight,
                "accepting": state.accepting,
                "gatewayReady": gateway_ready,
                "shuttingDown": shutting_down,
            })),
        }
    }
}
