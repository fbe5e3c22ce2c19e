//! Per-entity knowledge model.
//!
//! A [`KnowledgeRecord`] is the evolving knowledge base for one entity. It is
//! created by the first successful run, mutated only by the knowledge
//! integrator and removed only by an explicit cache clear.

mod delta;
mod record;
mod value;

pub use delta::*;
pub use record::*;
pub use value::*;
