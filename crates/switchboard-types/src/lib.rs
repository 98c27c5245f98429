//! Shared domain types for Switchboard.
//!
//! This crate contains the event envelope and its lifecycle, the five
//! built-in event kinds with their JSON codec, the agent message envelope,
//! configuration types and domain errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
