use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde::Serialize;
use utoipa::ToSchema;

use crate::model::{ModelInfo, model_catalog};
use crate::state::AppState;

#[derive(Serialize, ToSchema)]
pub struct ModelCatalogResponse {
    pub models: Vec<ModelInfo>,
    /// Model used when a turn names none.
    pub default: String,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/models", get(list_models))
}

/// The selectable model catalog. Listing a model does not guarantee its
/// provider is configured; an unconfigured selection fails at turn start.
#[utoipa::path(
    get,
    path = "/v1/models",
    responses(
        (status = 200, description = "Model catalog", body = ModelCatalogResponse)
    ),
    tag = "models"
)]
pub async fn list_models(State(state): State<AppState>) -> Json<ModelCatalogResponse> {
    Json(ModelCatalogResponse {
        models: model_catalog().to_vec(),
        default: state.models.default_model().to_string(),
    })
}
