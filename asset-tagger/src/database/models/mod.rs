//! Database models.
//!
//! Row structs map one-to-one onto the tables created by the migrations;
//! status columns are plain strings with typed enums alongside.

pub mod ai_info;
pub mod ai_job;
pub mod file;
pub mod setting;
pub mod tag;
pub mod tagging_log;

pub use ai_info::*;
pub use ai_job::*;
pub use file::*;
pub use setting::*;
pub use tag::*;
pub use tagging_log::*;
