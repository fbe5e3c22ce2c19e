//! HTTP API and SSE event streams over the orchestrator.

mod api;
mod error;
mod handlers;
mod server;
mod state;
mod stream;

pub use api::*;
pub use error::{ApiError, DashboardError};
pub use server::DashboardServer;
pub use state::AppState;
pub use stream::{replay_then_tail, sse_event};
