//! HTTP surface of the rehost server.

pub mod prometheus;
pub mod server;

#[cfg(test)]
mod server_tests;

pub use prometheus::render_prometheus;
pub use server::{bind_listener, build_router, serve, start_server, AppState};
