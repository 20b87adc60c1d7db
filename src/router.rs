//! HTTP Router (C7): endpoint registration under `/api/v0` and `/api/v1` (identical), the
//! Ollama surface, liveness/health, optional bearer auth, CORS/timeout/body-limit layers.
//!
//! Grounded on shimmy's `server.rs` router-construction shape, layered with `tower-http`
//! middleware the way the pack's other example repos compose an axum `Router`.

use crate::error::GatewayError;
use crate::state::SharedState;
use crate::translate::{ollama, openai};
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

pub fn build(state: SharedState) -> Router {
    let openai_routes = Router::new()
        .route("/load", post(openai::load))
        .route("/unload", post(openai::unload))
        .route("/pull", post(openai::pull))
        .route("/delete", post(openai::delete))
        .route("/models", get(openai::list_models))
        .route("/models/:id", get(openai::get_model))
        .route("/health", get(openai::health))
        .route("/stats", get(openai::stats))
        .route("/system-info", get(openai::system_info))
        .route("/chat/completions", post(openai::chat_completions))
        .route("/completions", post(openai::completions))
        .route("/embeddings", post(openai::embeddings))
        .route("/reranking", post(openai::reranking))
        .route("/responses", post(openai::responses))
        .route("/audio/transcriptions", post(openai::audio_transcriptions))
        .route("/audio/speech", post(openai::audio_speech))
        .route("/images/generations", post(openai::images_generations));

    let ollama_routes = Router::new()
        .route("/api/tags", get(ollama::tags))
        .route("/api/show", post(ollama::show))
        .route("/api/ps", get(ollama::ps))
        .route("/api/pull", post(ollama::pull))
        .route("/api/push", post(ollama::push))
        .route("/api/copy", post(ollama::copy))
        .route("/api/create", post(ollama::create))
        .route("/api/chat", post(ollama::chat))
        .route("/api/generate", post(ollama::generate))
        .route("/api/version", get(ollama::version))
        .route("/", get(ollama::root));

    let authed = Router::new()
        .nest("/api/v0", openai_routes.clone())
        .nest("/api/v1", openai_routes)
        .merge(ollama_routes)
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/live", get(openai::live))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `/live` is exempt (mounted outside this layer); every other endpoint requires a matching
/// `Authorization: Bearer <key>` header when `LEMONADE_API_KEY` is configured.
async fn require_api_key(
    State(state): State<SharedState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = &state.config.api_key else {
        return Ok(next.run(req).await);
    };
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(provided) if provided == expected => Ok(next.run(req).await),
        _ => Ok(GatewayError::Unauthorized.into_response()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state(api_key: Option<&str>) -> SharedState {
        let cache_dir = tempfile::tempdir().unwrap().keep();
        let config = crate::config::Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            log_level: "info".to_string(),
            api_key: api_key.map(|s| s.to_string()),
            llamacpp_backend: "cpu".to_string(),
            default_ctx_size: 4096,
            cache_dir: cache_dir.clone(),
            max_llm: 2,
            max_embedding: 1,
            max_reranking: 1,
        };
        let backend = crate::backend::detect();
        let catalog = crate::catalog::Catalog::load(&cache_dir).unwrap();
        let options = crate::options_store::OptionsStore::load(&cache_dir).unwrap();
        Arc::new(AppState::new(config, backend, catalog, options))
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn live_is_reachable_without_auth() {
        let app = build(test_state(Some("secret")));
        let resp = app
            .oneshot(Request::builder().uri("/live").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_bearer_token_is_rejected() {
        let app = build(test_state(Some("secret")));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_bearer_token_is_accepted() {
        let app = build(test_state(Some("secret")));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/models")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn no_configured_key_allows_any_request() {
        let app = build(test_state(None));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_model_renders_openai_error_shape() {
        let app = build(test_state(None));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/models/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert!(body["error"]["message"].is_string());
        assert_eq!(body["error"]["type"], "model_not_found");
    }

    #[tokio::test]
    async fn unknown_model_renders_ollama_error_shape() {
        let app = build(test_state(None));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/show")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"does-not-exist"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn health_reports_no_residency_when_idle() {
        let app = build(test_state(None));
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["at_capacity"], false);
        assert_eq!(body["max_models"]["total"], 4);
    }

    #[tokio::test]
    async fn unknown_recipe_pull_without_checkpoint_is_rejected() {
        let app = build(test_state(None));
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/pull")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model_name":"brand-new-model"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
