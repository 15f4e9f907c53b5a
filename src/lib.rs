#![forbid(unsafe_code)]

//! Coordinator for calls to a slow, unreliable external process.
//!
//! Each call is one supervised subprocess. Around it sit a durable SQLite
//! ledger for idempotency and crash recovery, a retry policy, resume
//! handling for continuation tokens, per-session usage accounting, and
//! per-class concurrency gates.

pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod process;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
