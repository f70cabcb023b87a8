//! Runtime setting models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// `settings` row; `value` is JSON text except for raw HTML keys.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettingDbModel {
    pub key: String,
    pub value: String,
    pub updated_at: i64,
}
