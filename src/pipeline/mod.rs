//! The run pipeline: scoping, verification, delta detection, merging and
//! the orchestrator that sequences them.

mod delta;
mod error;
mod integrator;
mod lock;
mod orchestrator;
mod schema;
pub mod scope;
mod stages;
mod types;
mod verifier;

pub use delta::*;
pub use error::*;
pub use integrator::*;
pub use lock::*;
pub use orchestrator::*;
pub use schema::*;
pub use stages::*;
pub use types::*;
pub use verifier::*;
