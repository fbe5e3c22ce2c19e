//! Run event protocol: wire types, recording, live fan-out and client-side reduction.

mod hub;
mod recorder;
mod reducer;
mod types;

pub use hub::*;
pub use recorder::*;
pub use reducer::*;
pub use types::*;
