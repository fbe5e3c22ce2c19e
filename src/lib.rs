//! Heartland Marathon - incremental, event-sourced area intelligence.
//!
//! A run re-investigates one entity: the scope stage picks which collectors
//! to call, their findings are verified against provenance, diffed against
//! the stored [`knowledge::KnowledgeRecord`] and merged into it. Every step
//! is recorded as a [`events::PipelineEvent`] that clients can replay or
//! tail over SSE.

pub mod ai;
pub mod collector;
pub mod config;
pub mod dashboard;
pub mod display;
pub mod events;
pub mod knowledge;
pub mod pipeline;
pub mod store;
