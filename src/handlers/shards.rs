use axum::{extract::State, http::StatusCode, response::IntoResponse, response::Response, Json};
use tracing::error;

use crate::store;
use crate::AppState;

/// GET /config/shards: the latest stored configuration document, verbatim.
pub async fn get_shard_config(State(state): State<AppState>) -> Response {
    match store::shards::latest(&state.db).await {
        Ok(Some(row)) => match serde_json::from_str::<serde_json::Value>(&row.document) {
            Ok(document) => Json(document).into_response(),
            Err(e) => {
                error!(row_id = row.id, "Stored shard document is not JSON: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(serde_json::json!({
                        "error": "internal_error",
                        "message": "Stored shard configuration is unreadable",
                    })),
                )
                    .into_response()
            }
        },
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "not_found",
                "message": "No shard configuration stored",
            })),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to load shard configuration: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal_error",
                    "message": "Internal error",
                })),
            )
                .into_response()
        }
    }
}
