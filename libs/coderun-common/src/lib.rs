//! Types and collaborators shared by the coderun API, CLI and worker.

pub mod config;
pub mod memory;
pub mod queue;
pub mod questions;
pub mod redis;
pub mod spec;
pub mod store;
pub mod types;
