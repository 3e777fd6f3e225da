//! The message processor: mints the relay-side message identity, drives
//! the task to a terminal outcome, and posts exactly one callback per
//! message with trace and usage provenance attached.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use uuid::Uuid;

use common::time::now_ms_i64;
use common::types::{
    ChatRunResult, InboundMessage, Outcome, OutcomeReport, RelayErrorCode, ReplyOutcome, TaskInput,
};
use common::usage::usage_delta;
use gateway::runner::RunnerMeta;
use gateway::{ChatRunner, GatewayHandle};

use crate::backend::OutcomeSink;
use crate::queue::MessageProcessor;

pub struct RelayProcessor {
    instance_id: String,
    gateway: Arc<dyn GatewayHandle>,
    runner: Arc<ChatRunner>,
    outcomes: Arc<dyn OutcomeSink>,
    task_timeout_ms: u64,
}

impl RelayProcessor {
    pub fn new(
        instance_id: String,
        gateway: Arc<dyn GatewayHandle>,
        runner: Arc<ChatRunner>,
        outcomes: Arc<dyn OutcomeSink>,
        task_timeout_ms: u64,
    ) -> Self {
        Self {
            instance_id,
            gateway,
            runner,
            outcomes,
            task_timeout_ms,
        }
    }

    async fn build_report(&self, message: &InboundMessage, relay_message_id: &str) -> OutcomeReport {
        match &message.input {
            TaskInput::Chat {
                session_key,
                message_text,
                media,
            } => {
                let (result, runner_meta) = self
                    .runner
                    .run_chat_task(
                        &message.message_id,
                        session_key,
                        message_text,
                        media,
                        self.task_timeout_ms,
                    )
                    .await;
                let run_id = result_run_id(&result);
                let meta = self.build_meta(message, relay_message_id, run_id, Some(&runner_meta));
                OutcomeReport::from_result(
                    &self.instance_id,
                    relay_message_id,
                    now_ms_i64(),
                    result,
                    Some(meta),
                )
            }
            TaskInput::Handshake { nonce } => {
                self.handshake_report(message, relay_message_id, nonce)
            }
            TaskInput::SessionNew {} => {
                let (rotated, failed) = self.runner.start_new_session_for_all().await;
                let meta = self.build_meta(message, relay_message_id, None, None);
                reply_report(
                    &self.instance_id,
                    relay_message_id,
                    json!({"rotated": rotated, "failed": failed}),
                    meta,
                )
            }
        }
    }

    /// Answer a handshake probe from the current hello without touching
    /// the Gateway: the probe verifies liveness of the relay↔gateway pair.
    fn handshake_report(
        &self,
        message: &InboundMessage,
        relay_message_id: &str,
        nonce: &str,
    ) -> OutcomeReport {
        let meta = self.build_meta(message, relay_message_id, None, None);
        let Some(hello) = self.gateway.hello() else {
            return error_report(
                &self.instance_id,
                relay_message_id,
                RelayErrorCode::GatewayError,
                "gateway is not connected",
                meta,
            );
        };
        let features = hello.features.unwrap_or_default();
        let mut reply = json!({
            "nonce": nonce,
            "helloType": "hello-ok",
            "protocol": hello.protocol,
            "policy": {"tickIntervalMs": hello.policy.tick_interval_ms},
            "features": {
                "methodsCount": features.methods.len(),
                "eventsCount": features.events.len(),
            },
        });
        if let Some(auth) = hello.auth {
            reply["auth"] = json!({"role": auth.role, "scopes": auth.scopes});
        }
        reply_report(&self.instance_id, relay_message_id, reply, meta)
    }

    fn build_meta(
        &self,
        message: &InboundMessage,
        relay_message_id: &str,
        run_id: Option<&str>,
        runner_meta: Option<&RunnerMeta>,
    ) -> Value {
        let mut meta = json!({});
        if let Some(runner_meta) = runner_meta {
            if let Some(incoming) = &runner_meta.usage_incoming {
                meta["usageIncoming"] = incoming.clone();
            }
            if let Some(outgoing) = &runner_meta.usage_outgoing {
                meta["usageOutgoing"] = outgoing.clone();
                if let Some(incoming) = &runner_meta.usage_incoming {
                    let delta = usage_delta(incoming, outgoing);
                    if let Ok(delta) = serde_json::to_value(&delta) {
                        meta["usage"] = delta;
                    }
                }
            }
        }
        let mut trace = json!({
            "backendMessageId": message.message_id,
            "relayMessageId": relay_message_id,
            "relayInstanceId": self.instance_id,
        });
        if let Some(run_id) = run_id {
            trace["openclawRunId"] = json!(run_id);
        }
        meta["trace"] = trace;
        meta
    }
}

#[async_trait]
impl MessageProcessor for RelayProcessor {
    async fn process(&self, message: InboundMessage) {
        let relay_message_id = Uuid::new_v4().to_string();
        tracing::debug!(
            message_id = %message.message_id,
            relay_message_id = %relay_message_id,
            "processing inbound message"
        );

        // A panicking task still owes the backend its one callback.
        let report = match AssertUnwindSafe(self.build_report(&message, &relay_message_id))
            .catch_unwind()
            .await
        {
            Ok(report) => report,
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                tracing::error!(
                    relay_message_id = %relay_message_id,
                    "processor panicked: {detail}"
                );
                let meta = self.build_meta(&message, &relay_message_id, None, None);
                error_report(
                    &self.instance_id,
                    &relay_message_id,
                    RelayErrorCode::RelayInternalError,
                    &format!("unexpected processor failure: {detail}"),
                    meta,
                )
            }
        };

        if let Err(err) = self.outcomes.submit_outcome(&report).await {
            // No durability: the failed callback is logged and dropped.
            tracing::error!(
                relay_message_id = %relay_message_id,
                "outcome delivery failed: {err}"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

fn result_run_id(result: &ChatRunResult) -> Option<&str> {
    match result {
        ChatRunResult::Reply { run_id, .. } | ChatRunResult::NoReply { run_id } => Some(run_id),
        ChatRunResult::Error { run_id, .. } => run_id.as_deref(),
    }
}

fn reply_report(
    instance_id: &str,
    relay_message_id: &str,
    message: Value,
    meta: Value,
) -> OutcomeReport {
    OutcomeReport {
        relay_instance_id: instance_id.to_string(),
        relay_message_id: relay_message_id.to_string(),
        finished_at_ms: now_ms_i64(),
        outcome: Outcome::Reply,
        reply: Some(ReplyOutcome {
            run_id: None,
            message,
            media: Vec::new(),
        }),
        no_reply: None,
        error: None,
        openclaw_meta: Some(meta),
    }
}

fn error_report(
    instance_id: &str,
    relay_message_id: &str,
    code: RelayErrorCode,
    message: &str,
    meta: Value,
) -> OutcomeReport {
    OutcomeReport::from_result(
        instance_id,
        relay_message_id,
        now_ms_i64(),
        ChatRunResult::Error {
            code,
            message: message.to_string(),
            run_id: None,
        },
        Some(meta),
    )
}

#[cfg(test)]
#[path = "processor_test.rs"]
mod processor_test;
