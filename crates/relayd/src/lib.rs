//! Relay daemon internals: HTTP ingress, bounded work queue, message
//! processor, and the backend callback client. The binary in `main.rs`
//! wires these to the Gateway client from the `gateway` crate.

pub mod backend;
pub mod processor;
pub mod push;
pub mod queue;
