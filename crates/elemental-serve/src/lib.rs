// ABOUTME: HTTP + SSE + WebSocket gateway exposing the orchestration core.
// ABOUTME: Routes, stream adapters, and server lifecycle.

mod routes;
mod server;
mod store_http;
mod ws;

pub use routes::{build_router, AppState};
pub use server::{run, ServeConfig};
pub use store_http::HttpTaskStore;
