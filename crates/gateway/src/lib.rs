//! Gateway-side half of the relay: the duplex correlated-frame client, the
//! chat runner that drives a single message to a terminal outcome, and the
//! on-disk collaborators (session store, transcript media, upload staging,
//! audio transcription, device identity).

pub mod client;
pub mod error;
pub mod identity;
pub mod media;
pub mod runner;
pub mod sessions;
pub mod transcribe;
pub mod uploads;

pub use client::{GatewayClient, GatewayClientConfig, GatewayEventMessage, GatewayHandle};
pub use error::GatewayError;
pub use runner::{ChatRunner, ChatRunnerConfig, RunnerMeta};
