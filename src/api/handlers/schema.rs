use axum::{extract::State, Json};

use crate::api::handlers::AppState;
use crate::api::middleware::AppError;
use crate::models::SchemaCatalog;

/// Current schema snapshot
pub async fn get_schema(State(state): State<AppState>) -> Result<Json<SchemaCatalog>, AppError> {
    let catalog = state.catalog.current()?;
    Ok(Json(catalog.as_ref().clone()))
}

/// Reload metadata from the database now
pub async fn refresh_schema(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("Refreshing schema catalog for {}", state.catalog.schema_name());
    let catalog = state.catalog.refresh().await?;

    Ok(Json(serde_json::json!({
        "schema": catalog.schema_name,
        "version": catalog.version,
        "tables": catalog.tables.len(),
        "retrieved_at": catalog.retrieved_at,
    })))
}
