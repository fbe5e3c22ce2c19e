//! Data collectors and the concurrent pool that runs them.

mod error;
mod http;
mod pool;
mod types;

pub use error::*;
pub use http::*;
pub use pool::*;
pub use types::*;
