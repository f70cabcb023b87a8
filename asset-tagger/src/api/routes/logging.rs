//! Log filter routes.

use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::logging::{LOG_FILTER_SETTING, LoggingConfig};

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFilterBody {
    pub filter: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/filter", get(get_filter).put(set_filter))
}

fn logging_config(state: &AppState) -> ApiResult<&LoggingConfig> {
    state
        .logging_config
        .as_deref()
        .ok_or_else(|| ApiError::service_unavailable("Logging configuration is not available"))
}

async fn get_filter(State(state): State<AppState>) -> ApiResult<Json<LogFilterBody>> {
    Ok(Json(LogFilterBody {
        filter: logging_config(&state)?.get_filter(),
    }))
}

/// Apply a new directive and persist it so restarts keep it.
async fn set_filter(
    State(state): State<AppState>,
    Json(body): Json<LogFilterBody>,
) -> ApiResult<Json<LogFilterBody>> {
    let config = logging_config(&state)?;
    config.set_filter(&body.filter)?;

    if let Some(admin) = &state.admin {
        admin
            .service()
            .settings()
            .set(LOG_FILTER_SETTING, json!(body.filter))
            .await?;
    }
    Ok(Json(LogFilterBody {
        filter: config.get_filter(),
    }))
}
