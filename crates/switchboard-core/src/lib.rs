//! Event coordination logic for Switchboard.
//!
//! Layers, leaf-first: subscription filters, the in-memory event store, the
//! event bus (delivery, retry, overflow queues, dead letters, metrics), the
//! publisher and subscriber facades, and the agent message router on top.
//!
//! Depends only on `switchboard-types`; configuration loading and tracing
//! setup live in `switchboard-infra` and `switchboard-observe`.

pub mod alert;
pub mod bus;
pub mod directory;
pub mod filter;
pub mod publisher;
pub mod retry;
pub mod router;
pub mod store;
pub mod subscriber;
pub mod subscription;
