//! Infrastructure layer for Switchboard.
//!
//! Implements the ports defined in `switchboard-core` and the file-backed
//! pieces the core stays free of: TOML configuration loading and a
//! config-backed agent directory.

pub mod config;
pub mod directory;
