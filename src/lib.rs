//! Batch job orchestration on external schedulers.

pub mod archive;
pub mod batch;
pub mod config;
pub mod error;
pub mod operator;
pub mod record;
pub mod retry;
pub mod runner;
pub mod state;
