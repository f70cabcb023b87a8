//! Process configuration from the environment.

use std::path::PathBuf;

use crate::{Error, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite:tagger.db?mode=rwc";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_STORAGE_ROOT: &str = "data";

/// Which job queue implementation backs the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum QueueBackendKind {
    /// `ai_job` table in the main database.
    Db,
    /// In-process lists; lost on restart.
    Memory,
    /// Redis lists and sorted sets (feature `redis-backend`).
    Redis,
}

/// Settings fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub storage_root: PathBuf,
    pub queue_backend: QueueBackendKind,
    pub redis_url: Option<String>,
    pub worker_id: String,
}

impl ProcessConfig {
    /// Read `DATABASE_URL`, `LOG_DIR`, `STORAGE_ROOT`, `TAGGER_QUEUE_BACKEND`,
    /// `REDIS_URL` and `TAGGER_WORKER_ID`.
    pub fn from_env() -> Result<Self> {
        let redis_url = non_empty_var("REDIS_URL");
        let queue_backend = match non_empty_var("TAGGER_QUEUE_BACKEND") {
            Some(raw) => raw
                .parse::<QueueBackendKind>()
                .map_err(|_| Error::config(format!("unknown TAGGER_QUEUE_BACKEND '{raw}'")))?,
            None if redis_url.is_some() && cfg!(feature = "redis-backend") => {
                QueueBackendKind::Redis
            }
            None => QueueBackendKind::Db,
        };

        Ok(Self {
            database_url: non_empty_var("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            log_dir: non_empty_var("LOG_DIR")
                .unwrap_or_else(|| DEFAULT_LOG_DIR.to_string())
                .into(),
            storage_root: non_empty_var("STORAGE_ROOT")
                .unwrap_or_else(|| DEFAULT_STORAGE_ROOT.to_string())
                .into(),
            queue_backend,
            redis_url,
            worker_id: non_empty_var("TAGGER_WORKER_ID").unwrap_or_else(default_worker_id),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `tagger-<pid>-<8 hex>`; unique enough to tell processes apart in lease columns.
pub fn default_worker_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("tagger-{}-{}", std::process::id(), &suffix[..8])
}
