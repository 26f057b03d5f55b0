//! Resume-agent gateway — a multi-tenant HTTP service orchestrating
//! long-running, human-in-the-loop runs of an LLM resume agent.
//!
//! The interesting machinery lives in [`runtime`]: a durable store with
//! an append-only per-run event journal, a FIFO scheduler with a single
//! worker, an approval coordinator built on level-triggered latches,
//! and a startup normalizer that makes cold restarts consistent.
//! [`api`] is the axum surface over it.

pub mod api;
pub mod runtime;
pub mod state;
