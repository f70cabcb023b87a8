//! Thin HTTP surface over the tagging admin operations.
//!
//! Authentication is handled in front of this server.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
