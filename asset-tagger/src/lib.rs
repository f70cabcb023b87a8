//! asset-tagger library crate.
//!
//! Leased job queue and worker pipeline that tags hosted images with a
//! remote vision model.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod services;
pub mod storage;
pub mod tagging;
pub mod utils;
pub mod vision;

pub use error::{Error, Result};
