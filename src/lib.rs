//! mend library crate
//!
//! Test generation and self-healing pipeline. The binary is a thin CLI over
//! `pipeline::Pipeline`; benchmarks and integration tests use the same
//! modules directly.

pub mod cache;
pub mod config;
pub mod control;
pub mod eligibility;
pub mod generate;
pub mod git_ops;
pub mod heal;
pub mod history;
pub mod llm;
pub mod pipeline;
pub mod publish;
pub mod results;
pub mod sandbox;
pub mod signatures;
pub mod source;
pub mod testing;
pub mod util;
