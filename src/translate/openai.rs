//! OpenAI-dialect endpoints (`/api/v{0,1}/…`).
//!
//! Request/response field shapes transcribed from `original_source/src/lemonade_server/pydantic_models.py`
//! (`CompletionRequest`, `ChatCompletionRequest`, `EmbeddingsRequest`, `RerankingRequest`).
//! Handler structure grounded on `Rauxon-sovereign-engine/proxy/src/api/openai.rs`'s
//! `proxy_completion` (resolve → acquire → proxy → relay-or-stream).

use crate::cache::parse_checkpoint;
use crate::catalog::{ModelDescriptor, Source};
use crate::error::{GatewayError, Result};
use crate::state::SharedState;
use crate::translate::ensure_ready;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct LoadRequest {
    pub model_name: String,
    pub ctx_size: Option<u32>,
    pub llamacpp_backend: Option<String>,
    pub llamacpp_args: Option<String>,
    #[serde(default)]
    pub save_options: bool,
}

pub async fn load(State(state): State<SharedState>, Json(req): Json<LoadRequest>) -> Result<Response> {
    let (descriptor, _handle) = ensure_ready(&state, &req.model_name).await?;
    if req.save_options {
        state.options.save(
            &descriptor.name,
            crate::options_store::RecipeOptions {
                ctx_size: req.ctx_size,
                llamacpp_backend: req.llamacpp_backend,
                llamacpp_args: req.llamacpp_args,
            },
        )?;
    }
    Ok(Json(json!({"status": "success"})).into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct UnloadRequest {
    pub model_name: Option<String>,
}

pub async fn unload(
    State(state): State<SharedState>,
    body: Option<Json<UnloadRequest>>,
) -> Result<Response> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    state.scheduler.unload(req.model_name.as_deref()).await?;
    Ok(Json(json!({"status": "success"})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PullRequest {
    pub model_name: String,
    pub checkpoint: Option<String>,
    pub recipe: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub mmproj: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

pub async fn pull(State(state): State<SharedState>, Json(req): Json<PullRequest>) -> Result<Response> {
    let descriptor = {
        let catalog = state.catalog.lock();
        catalog.lookup(&req.model_name).cloned()
    };
    let descriptor = match descriptor {
        Some(d) => d,
        None => {
            let checkpoint = req
                .checkpoint
                .ok_or_else(|| GatewayError::InvalidRequest("unknown model requires checkpoint+recipe".to_string()))?;
            let recipe = req
                .recipe
                .ok_or_else(|| GatewayError::InvalidRequest("unknown model requires recipe".to_string()))?;
            ModelDescriptor {
                name: req.model_name.clone(),
                checkpoint,
                recipe,
                labels: req.labels,
                mmproj: req.mmproj,
                source: Source::LocalUpload,
                reasoning: None,
            }
        }
    };

    if req.stream {
        let stream = state.resolver.download_stream(descriptor.clone());
        let sse = crate::translate::sse_from_pull_events(stream);
        return Ok(sse.into_response());
    }

    state.resolver.download(&descriptor, true).await?;
    if state.catalog.lock().lookup(&descriptor.name).is_none() {
        state.catalog.lock().register(descriptor)?;
    }
    Ok(Json(json!({"status": "success"})).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub model_name: String,
}

pub async fn delete(State(state): State<SharedState>, Json(req): Json<DeleteRequest>) -> Result<Response> {
    let descriptor = {
        let catalog = state.catalog.lock();
        catalog
            .lookup(&req.model_name)
            .cloned()
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown model {}", req.model_name)))?
    };
    state.resolver.delete(&descriptor)?;
    state.catalog.lock().delete(&req.model_name).ok();
    Ok(Json(json!({"status": "success"})).into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct ModelsQuery {
    #[serde(default)]
    pub show_all: bool,
}

pub async fn list_models(State(state): State<SharedState>, Query(q): Query<ModelsQuery>) -> Result<Response> {
    let catalog = state.catalog.lock();
    let enabled = catalog.filter_enabled(&state.backend)?;
    let data: Vec<Value> = enabled
        .values()
        .filter(|d| q.show_all || state.resolver.resolve_local(d).is_some())
        .map(|d| json!({"id": d.name, "object": "model", "checkpoint": d.checkpoint, "recipe": d.recipe}))
        .collect();
    Ok(Json(json!({"object": "list", "data": data})).into_response())
}

pub async fn get_model(State(state): State<SharedState>, Path(id): Path<String>) -> Result<Response> {
    let catalog = state.catalog.lock();
    let descriptor = catalog
        .lookup(&id)
        .ok_or_else(|| GatewayError::NotFound(id.clone()))?;
    let options = state.options.get(&descriptor.name).unwrap_or_default();
    Ok(Json(json!({
        "id": descriptor.name,
        "checkpoint": descriptor.checkpoint,
        "recipe": descriptor.recipe,
        "recipe_options": options,
    }))
    .into_response())
}

pub async fn health(State(state): State<SharedState>) -> Response {
    let loaded = state.scheduler.list_loaded().await;
    let all_models_loaded: Vec<Value> = loaded
        .iter()
        .map(|l| {
            json!({
                "name": l.name,
                "type": l.kind,
                "ready": l.ready,
                "device": l.device,
                "checkpoint": l.checkpoint,
                "last_use": l.last_use,
                "recipe_options": l.recipe_options,
            })
        })
        .collect();
    Json(json!({
        "status": "ok",
        "all_models_loaded": all_models_loaded,
        "at_capacity": state.scheduler.all_models_loaded().await,
        "max_models": {
            "llm": state.config.max_llm,
            "embedding": state.config.max_embedding,
            "reranking": state.config.max_reranking,
            "total": state.scheduler.max_models(),
        },
    }))
    .into_response()
}

pub async fn live() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub model_name: Option<String>,
}

pub async fn stats(State(state): State<SharedState>, Query(q): Query<StatsQuery>) -> Result<Response> {
    let name = q
        .model_name
        .ok_or_else(|| GatewayError::InvalidRequest("model_name required".to_string()))?;
    let (_, handle) = ensure_ready(&state, &name).await?;
    let server = handle.read().await;
    let engine_stats = server.stats();
    Ok(Json(json!({
        "model": server.descriptor.name,
        "state": format!("{:?}", server.state()),
        "stats": engine_stats,
    }))
    .into_response())
}

#[derive(Debug, Deserialize, Default)]
pub struct SystemInfoQuery {
    #[serde(default)]
    pub verbose: bool,
}

pub async fn system_info(State(state): State<SharedState>, Query(q): Query<SystemInfoQuery>) -> Response {
    let mut body = json!(state.backend);
    if !q.verbose {
        if let Value::Object(ref mut map) = body {
            map.retain(|k, _| k != "amd_dgpu" && k != "nvidia_dgpu");
        }
    }
    Json(body).into_response()
}

/// Chat/completions style proxy: forwards the raw JSON body to the resolved wrapped
/// server, streaming its SSE response through untouched when `stream: true`.
pub async fn chat_completions(State(state): State<SharedState>, body: Json<Value>) -> Result<Response> {
    proxy_json(state, "/v1/chat/completions", body.0).await
}

pub async fn completions(State(state): State<SharedState>, body: Json<Value>) -> Result<Response> {
    proxy_json(state, "/v1/completions", body.0).await
}

pub async fn embeddings(State(state): State<SharedState>, body: Json<Value>) -> Result<Response> {
    proxy_json(state, "/v1/embeddings", body.0).await
}

pub async fn reranking(State(state): State<SharedState>, body: Json<Value>) -> Result<Response> {
    proxy_json(state, "/v1/rerank", body.0).await
}

pub async fn responses(State(state): State<SharedState>, body: Json<Value>) -> Result<Response> {
    proxy_json(state, "/v1/responses", body.0).await
}

pub async fn audio_transcriptions(State(state): State<SharedState>, body: Json<Value>) -> Result<Response> {
    proxy_json(state, "/v1/audio/transcriptions", body.0).await
}

pub async fn audio_speech(State(state): State<SharedState>, body: Json<Value>) -> Result<Response> {
    proxy_json(state, "/v1/audio/speech", body.0).await
}

pub async fn images_generations(State(state): State<SharedState>, body: Json<Value>) -> Result<Response> {
    proxy_json(state, "/v1/images/generations", body.0).await
}

async fn proxy_json(state: SharedState, path: &str, body: Value) -> Result<Response> {
    let name = body
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::InvalidRequest("model field required".to_string()))?
        .to_string();
    let (descriptor, handle) = ensure_ready(&state, &name).await?;
    let kind = crate::wrapped::EngineKind::from_recipe(&descriptor.recipe);
    if !kind.supports(path) {
        return Err(GatewayError::Unsupported(format!("{path} is not supported by recipe {}", descriptor.recipe)));
    }
    let (checkpoint, _) = parse_checkpoint(&descriptor.checkpoint);
    let mut body = body;
    if let Some(rewritten) = kind.rewrite_model_field(&checkpoint) {
        body["model"] = Value::String(rewritten);
    }
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let bytes = bytes::Bytes::from(serde_json::to_vec(&body).map_err(|e| anyhow::anyhow!(e))?);

    let server = handle.read().await;
    let response = server.proxy(path, bytes).await?;
    drop(server);

    if stream {
        let byte_stream = response.bytes_stream();
        Ok(Response::builder()
            .header("content-type", "text/event-stream")
            .body(Body::from_stream(byte_stream))
            .map_err(|e| anyhow::anyhow!(e))?)
    } else {
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let json: Value = response
            .json()
            .await
            .unwrap_or_else(|_| json!({"status": "success"}));
        Ok((status, Json(json)).into_response())
    }
}
