//! Core library for loom: domain types, the bead work-queue, the persistence
//! port, and the safety-gated git layer.
//!
//! This crate is the foundation the rest of the system builds on:
//! - Bead / agent / task / conversation types
//! - The dependency-aware bead manager with its YAML corpus mirror
//! - Configuration loading
//! - The persistence port (agents, conversations, lessons)
//! - Git gateway with branch policy, secret scanning, and audit logging
//! - Shutdown coordination and the daemon lockfile

pub mod beads;
pub mod config;
pub mod git;
pub mod lockfile;
pub mod persist;
pub mod secrets;
pub mod shutdown;
pub mod types;

#[cfg(feature = "libgit2")]
pub mod git2_ops;
