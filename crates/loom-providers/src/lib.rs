//! LLM provider layer for loom: the abstract protocol the engine consumes,
//! concrete HTTP clients, and the health-tracking registry.

pub mod client;
pub mod protocol;
pub mod registry;
