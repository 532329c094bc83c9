use axum::{
    extract::State,
    routing::{delete, get, post},
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::{conversation, schema, AppState};

/// Create router with application state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/schema", get(schema::get_schema))
        .route("/api/schema/refresh", post(schema::refresh_schema))
        .route("/api/sessions", post(conversation::create_session))
        .route("/api/sessions/{id}", delete(conversation::delete_session))
        .route("/api/sessions/{id}/turns", post(conversation::submit_turn))
        .route("/api/sessions/{id}/cancel", post(conversation::cancel_turn))
        .route("/api/sessions/{id}/history", get(conversation::get_history))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let catalog_version = state.catalog.current().ok().map(|catalog| catalog.version);
    Json(serde_json::json!({
        "status": "ok",
        "catalog_version": catalog_version,
        "sessions": state.sessions.len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineConfig, SessionConfig};
    use crate::services::{
        IntentRouter, LlmService, Orchestrator, QueryService, QuerySynthesizer, SchemaCatalogService, SessionManager,
    };
    use crate::test_support::{bookings_catalog, FakeAdapter, RecordingChat, ScriptedLlm};
    use crate::validation::SqlValidator;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app(load_catalog: bool) -> (Router, Arc<ScriptedLlm>) {
        let adapter = Arc::new(FakeAdapter::new().with_catalog(bookings_catalog()).with_rows(2));
        let catalog = Arc::new(SchemaCatalogService::new(adapter.clone(), None, "bookings", 0));
        if load_catalog {
            catalog.load().await.unwrap();
        } else {
            adapter.fail_catalog(true);
        }

        let config = PipelineConfig::default();
        let llm = Arc::new(ScriptedLlm::new());
        let llm_service = LlmService::with_backoff(llm.clone(), Duration::from_millis(1));
        let orchestrator = Orchestrator::new(
            catalog.clone(),
            IntentRouter::new(llm_service.clone(), config.confidence_threshold, config.history_window),
            QuerySynthesizer::new(llm_service, &config),
            SqlValidator::default(),
            QueryService::new(adapter, config.row_cap),
            Arc::new(RecordingChat::new()),
            config,
        );
        let state = AppState {
            sessions: Arc::new(SessionManager::new(Arc::new(orchestrator), &SessionConfig::default())),
            catalog,
        };
        (create_router(state), llm)
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app(true).await;
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["catalog_version"], 1);
    }

    #[tokio::test]
    async fn test_conversation_round_trip() {
        let (app, llm) = app(true).await;
        llm.push_text(json!({"intent": "run_query", "confidence": 0.9}).to_string());
        llm.push_text(
            json!({"candidates": [{"sql": "SELECT book_ref, total_amount FROM bookings WHERE total_amount > 500", "explanation": "Bookings above 500", "confidence": 0.9}]})
                .to_string(),
        );

        let (status, session) = send(&app, Method::POST, "/api/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = session["id"].as_str().unwrap().to_string();

        let (status, turn) = send(
            &app,
            Method::POST,
            &format!("/api/sessions/{}/turns", id),
            Some(json!({"question": "Show me all bookings where total exceeds 500"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(turn["intent"], "run_query");
        assert_eq!(turn["body"]["kind"], "rows");
        assert_eq!(turn["body"]["result"]["row_count"], 2);
        assert_eq!(turn["trace"][0], "classifying");

        let (status, history) = send(&app, Method::GET, &format!("/api/sessions/{}/history", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["state"]["state"], "idle");
        assert_eq!(history["turns"].as_array().unwrap().len(), 1);

        let (status, cancel) = send(&app, Method::POST, &format!("/api/sessions/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancel["cancelled"], false);

        let (status, _) = send(&app, Method::DELETE, &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, Method::GET, &format!("/api/sessions/{}/history", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_pipeline_failure_is_still_200() {
        let (app, llm) = app(true).await;
        llm.push_failure("gateway down");
        llm.push_failure("gateway down");

        let (_, session) = send(&app, Method::POST, "/api/sessions", None).await;
        let id = session["id"].as_str().unwrap();
        let (status, turn) = send(
            &app,
            Method::POST,
            &format!("/api/sessions/{}/turns", id),
            Some(json!({"question": "how many bookings?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(turn["body"]["kind"], "failure");
        assert_eq!(turn["body"]["code"], "MODEL_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_bad_input_is_rejected() {
        let (app, _) = app(true).await;
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/sessions/not-a-uuid/turns",
            Some(json!({"question": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        let (_, session) = send(&app, Method::POST, "/api/sessions", None).await;
        let id = session["id"].as_str().unwrap();
        let (status, _) = send(
            &app,
            Method::POST,
            &format!("/api/sessions/{}/turns", id),
            Some(json!({"question": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_schema_endpoints() {
        let (app, _) = app(true).await;
        let (status, schema) = send(&app, Method::GET, "/api/schema", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(schema["tables"]["bookings"].is_object());

        let (status, refreshed) = send(&app, Method::POST, "/api/schema/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(refreshed["version"], 2);
        assert_eq!(refreshed["tables"], 3);
    }

    #[tokio::test]
    async fn test_schema_unavailable_is_503() {
        let (app, _) = app(false).await;
        let (status, body) = send(&app, Method::GET, "/api/schema", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");

        let (status, _) = send(&app, Method::POST, "/api/schema/refresh", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
