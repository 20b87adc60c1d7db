//! Translation Layer (C6): OpenAI + Ollama endpoints onto a single internal dispatcher.
//!
//! Grounded on `Rauxon-sovereign-engine/proxy/src/api/openai.rs` (`proxy_completion`'s
//! error-body/404/503/429 flow) and `proxy/src/proxy/streaming.rs` (`proxy_to_backend` SSE
//! passthrough), generalized to also emit Ollama NDJSON: a single internal event stream per
//! request, framing chosen at the boundary by dialect.

pub mod ollama;
pub mod openai;

use crate::cache::PullEvent;
use crate::catalog::ModelDescriptor;
use crate::error::{GatewayError, Result};
use crate::state::SharedState;
use crate::wrapped::WrappedServer;
use axum::response::sse::{Event, Sse};
use futures_util::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Resolve `name` to a descriptor, ensure its files are local (no network unless missing),
/// and hand back a Ready wrapped server handle from the scheduler — spawning one if needed.
pub async fn ensure_ready(
    state: &SharedState,
    name: &str,
) -> Result<(ModelDescriptor, Arc<RwLock<WrappedServer>>)> {
    let descriptor = {
        let catalog = state.catalog.lock();
        catalog
            .lookup(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))?
    };

    let paths = state.resolver.download(&descriptor, false).await?;
    let options = state.options.get(&descriptor.name);
    let ctx_size = options
        .as_ref()
        .and_then(|o| o.ctx_size)
        .unwrap_or(state.config.default_ctx_size);
    let backend = options
        .as_ref()
        .and_then(|o| o.llamacpp_backend.clone())
        .unwrap_or_else(|| state.config.llamacpp_backend.clone());

    let handle = state
        .scheduler
        .acquire(&descriptor, &paths, ctx_size, &backend)
        .await?;
    Ok((descriptor, handle))
}

/// Strip a trailing `:latest` tag, matching Ollama's model-name convention.
pub fn strip_latest_tag(name: &str) -> &str {
    name.strip_suffix(":latest").unwrap_or(name)
}

pub fn with_latest_tag(name: &str) -> String {
    if name.contains(':') {
        name.to_string()
    } else {
        format!("{name}:latest")
    }
}

/// Frame a [`PullEvent`] stream as SSE (`event: progress|error|complete`), for the OpenAI
/// `/pull?stream=true` endpoint. The Ollama surface frames the same stream as NDJSON instead
/// (see `translate::ollama::pull`) — a single internal event stream, framed at the boundary.
pub fn sse_from_pull_events(
    stream: impl Stream<Item = PullEvent> + Send + 'static,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let events = stream.map(|event| {
        let kind = if event.status.starts_with("error") {
            "error"
        } else if event.status == "success" {
            "complete"
        } else {
            "progress"
        };
        Ok(Event::default()
            .event(kind)
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().event("error").data("serialization failed")))
    });
    Sse::new(events)
}
