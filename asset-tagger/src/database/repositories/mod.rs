//! Repository layer for database access.
//!
//! Each table the tagging core touches gets a trait plus an SQLx
//! implementation; multi-statement result writes live in [`ai_result_tx`].

pub mod ai_job;
pub mod ai_result_tx;
pub mod file;
pub mod settings;
pub mod tagging_log;

pub use ai_job::*;
pub use ai_result_tx::*;
pub use file::*;
pub use settings::*;
pub use tagging_log::*;
