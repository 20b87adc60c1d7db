//! Ollama-dialect endpoints (`/api/{tags,show,ps,pull,push,copy,create,chat,generate,version}`).
//!
//! Grounded on the same `Rauxon-sovereign-engine` proxy flow as the OpenAI surface, with its
//! own SSE→NDJSON reframing and `:latest`-tag handling for the Ollama dialect.

use crate::error::{GatewayError, OllamaResult};
use crate::state::SharedState;
use crate::translate::{ensure_ready, strip_latest_tag, with_latest_tag};
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use serde_json::{json, Value};

pub async fn version() -> Response {
    Json(json!({"version": env!("CARGO_PKG_VERSION")})).into_response()
}

pub async fn root() -> &'static str {
    "lemonade-server-core is running"
}

pub async fn tags(State(state): State<SharedState>) -> OllamaResult<Response> {
    let catalog = state.catalog.lock();
    let models: Vec<Value> = catalog
        .filter_enabled(&state.backend)?
        .values()
        .filter(|d| state.resolver.resolve_local(d).is_some())
        .map(|d| json!({"name": with_latest_tag(&d.name), "model": with_latest_tag(&d.name)}))
        .collect();
    Ok(Json(json!({"models": models})).into_response())
}

#[derive(serde::Deserialize)]
pub struct ShowRequest {
    pub name: String,
}

pub async fn show(State(state): State<SharedState>, Json(req): Json<ShowRequest>) -> OllamaResult<Response> {
    let name = strip_latest_tag(&req.name);
    let catalog = state.catalog.lock();
    let descriptor = catalog
        .lookup(name)
        .ok_or_else(|| GatewayError::NotFound(name.to_string()))?;
    Ok(Json(json!({
        "modelfile": "",
        "parameters": "",
        "template": "",
        "details": {"family": descriptor.recipe, "checkpoint": descriptor.checkpoint},
    }))
    .into_response())
}

pub async fn ps(State(state): State<SharedState>) -> Response {
    let loaded = state.scheduler.list_loaded().await;
    let models: Vec<Value> = loaded
        .iter()
        .map(|l| {
            json!({
                "name": with_latest_tag(&l.name),
                "model": with_latest_tag(&l.name),
                "expires_at": Value::Null,
                "size_vram": 0,
                "details": {"type": l.kind, "device": l.device, "checkpoint": l.checkpoint},
                "last_use": l.last_use,
                "recipe_options": l.recipe_options,
            })
        })
        .collect();
    Json(json!({"models": models})).into_response()
}

#[derive(serde::Deserialize)]
pub struct PullRequest {
    pub name: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

pub async fn pull(State(state): State<SharedState>, Json(req): Json<PullRequest>) -> OllamaResult<Response> {
    let name = strip_latest_tag(&req.name);
    let descriptor = {
        let catalog = state.catalog.lock();
        catalog
            .lookup(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?
    };

    if !req.stream {
        state.resolver.download(&descriptor, true).await?;
        return Ok(Json(json!({"status": "success"})).into_response());
    }

    let events = state.resolver.download_stream(descriptor);
    let ndjson = events.map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_default();
        line.push('\n');
        std::result::Result::<_, std::io::Error>::Ok(bytes::Bytes::from(line))
    });
    Ok(Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(ndjson))
        .map_err(|e| anyhow::anyhow!(e))?)
}

pub async fn push() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}
pub async fn copy() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}
pub async fn create() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

#[derive(serde::Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub options: Value,
    pub keep_alive: Option<Value>,
}

pub async fn chat(State(state): State<SharedState>, Json(req): Json<ChatRequest>) -> OllamaResult<Response> {
    let max_tokens = req.options.get("num_predict").and_then(|v| v.as_i64());
    dispatch_generate(
        state,
        strip_latest_tag(&req.model),
        req.messages,
        req.stream,
        req.keep_alive,
        true,
        max_tokens,
    )
    .await
}

#[derive(serde::Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    pub keep_alive: Option<Value>,
}

pub async fn generate(State(state): State<SharedState>, Json(req): Json<GenerateRequest>) -> OllamaResult<Response> {
    // `keep_alive: 0` with an empty prompt is unload-by-name, not an inference call.
    let is_unload = req.prompt.is_empty() && matches!(&req.keep_alive, Some(v) if v.as_i64() == Some(0));
    if is_unload {
        let name = strip_latest_tag(&req.model);
        state.scheduler.unload(Some(name)).await.ok();
        return Ok(Json(json!({"done": true, "done_reason": "unload"})).into_response());
    }

    let messages = vec![json!({"role": "user", "content": req.prompt})];
    dispatch_generate(
        state,
        strip_latest_tag(&req.model),
        messages,
        req.stream,
        req.keep_alive,
        false,
        None,
    )
    .await
}

/// Both `/api/chat` and `/api/generate` map onto OpenAI chat/completions, differing only in
/// whether the NDJSON chunk carries a `message` or `response` field.
async fn dispatch_generate(
    state: SharedState,
    name: &str,
    messages: Vec<Value>,
    stream: bool,
    _keep_alive: Option<Value>,
    as_message: bool,
    max_tokens: Option<i64>,
) -> OllamaResult<Response> {
    let (descriptor, handle) = ensure_ready(&state, name).await?;
    let mut body = json!({"model": descriptor.checkpoint, "messages": messages, "stream": stream});
    if let Some(max_tokens) = max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    let bytes = bytes::Bytes::from(serde_json::to_vec(&body).map_err(|e| anyhow::anyhow!(e))?);

    let server = handle.read().await;
    let response = server.proxy("/v1/chat/completions", bytes).await?;
    drop(server);

    let model_name = name.to_string();
    if stream {
        let ndjson = reframe_sse_as_ndjson(response.bytes_stream(), model_name, as_message);
        Ok(Response::builder()
            .header("content-type", "application/x-ndjson")
            .body(Body::from_stream(ndjson))
            .map_err(|e| anyhow::anyhow!(e))?)
    } else {
        let parsed: Value = response.json().await.unwrap_or_else(|_| json!({}));
        let content = parsed["choices"][0]["message"]["content"].as_str().unwrap_or("");
        let obj = if as_message {
            json!({"model": name, "done": true, "message": {"role": "assistant", "content": content}})
        } else {
            json!({"model": name, "done": true, "response": content})
        };
        Ok(Json(obj).into_response())
    }
}

/// Reframe an upstream SSE `data: ...` byte stream as NDJSON, one line per event. Buffers
/// across `bytes_stream()` chunk boundaries rather than assuming a chunk carries exactly one
/// complete event: a chunk may end mid-line, or carry several events back to back.
fn reframe_sse_as_ndjson(
    byte_stream: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
    model_name: String,
    as_message: bool,
) -> impl futures_util::Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>> {
    async_stream::stream! {
        futures_util::pin_mut!(byte_stream);
        let mut buf = String::new();
        while let Some(chunk) = byte_stream.next().await {
            let Ok(chunk) = chunk else { break };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else { continue };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    let obj = json!({"model": model_name, "done": true});
                    yield Ok(bytes::Bytes::from(format!("{obj}\n")));
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<Value>(data) else { continue };
                let delta = parsed["choices"][0]["delta"]["content"].as_str().unwrap_or("");
                let obj = if as_message {
                    json!({"model": model_name, "done": false, "message": {"role": "assistant", "content": delta}})
                } else {
                    json!({"model": model_name, "done": false, "response": delta})
                };
                yield Ok(bytes::Bytes::from(format!("{obj}\n")));
            }
        }
    }
}
