//! Observability wiring for Switchboard binaries.

pub mod messaging_attrs;
pub mod tracing_setup;
