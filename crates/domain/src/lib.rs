//! Shared contracts for the resume-agent gateway: run/workflow state
//! machines, the uniform API error envelope, and the env-driven config.

pub mod config;
pub mod error;
pub mod runtime;

pub use error::{ApiError, Result};
