//! Model Scheduler (C5): bounded-residency LRU pool, one [`WrappedServer`] per loaded
//! model, per-kind quotas (`llm`/`embedding`/`reranking`), NPU exclusivity.
//!
//! Grounded on shimmy's `preloading.rs` `SmartPreloader` (bounded pool + LRU eviction)
//! generalized to per-kind quotas, and `Rauxon-sovereign-engine/proxy/src/scheduler/mod.rs`'s
//! facade-over-`Arc`-internals shape. Concurrent `acquire()` calls for the same name collapse
//! onto a single spawn via `tokio::sync::OnceCell`, which natively provides "first caller
//! initializes, the rest await the same future" without a hand-rolled notify/broadcast
//! mechanism.

use crate::cache::LocalPaths;
use crate::catalog::ModelDescriptor;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::options_store::RecipeOptions;
use crate::wrapped::WrappedServer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as TokioMutex, OnceCell, RwLock};

/// Guards a loaded server's mutable lifecycle operations (`spawn`/`stop`) without
/// serializing the concurrent in-flight requests that only need `proxy`/`stats` (`&self`).
type ServerHandle = Arc<RwLock<WrappedServer>>;
type ServerCell = Arc<OnceCell<std::result::Result<ServerHandle, String>>>;

struct Slot {
    descriptor: ModelDescriptor,
    cell: ServerCell,
    last_used: SystemTime,
    ctx_size: u32,
    backend: String,
}

struct SchedulerState {
    slots: HashMap<String, Slot>,
}

pub struct LoadedInfo {
    pub name: String,
    pub kind: String,
    pub ready: bool,
    pub device: String,
    pub checkpoint: String,
    pub last_use: u64,
    pub recipe_options: RecipeOptions,
}

pub struct ModelScheduler {
    state: TokioMutex<SchedulerState>,
    config: Config,
}

impl ModelScheduler {
    pub fn new(config: Config) -> Self {
        Self {
            state: TokioMutex::new(SchedulerState {
                slots: HashMap::new(),
            }),
            config,
        }
    }

    pub fn max_models(&self) -> usize {
        self.config.max_llm + self.config.max_embedding + self.config.max_reranking
    }

    /// Load (or return the already-loaded/loading) wrapped server for `descriptor`. A quota
    /// violation evicts the least-recently-used sibling(s) of the same kind; a model
    /// requiring NPU exclusivity first evicts every other NPU-resident model regardless
    /// of kind, since the NPU runtime cannot be shared. A resident slot whose `ctx_size`/
    /// `backend` no longer match what's requested is treated as absent: it is evicted and
    /// a fresh server is spawned under the new options rather than silently reused.
    pub async fn acquire(
        &self,
        descriptor: &ModelDescriptor,
        paths: &LocalPaths,
        ctx_size: u32,
        backend: &str,
    ) -> Result<ServerHandle> {
        let cell = {
            let mut state = self.state.lock().await;
            let reusable = state
                .slots
                .get(&descriptor.name)
                .is_some_and(|slot| slot_options_match(slot, ctx_size, backend));

            if reusable {
                let slot = state.slots.get_mut(&descriptor.name).unwrap();
                slot.last_used = SystemTime::now();
                slot.cell.clone()
            } else {
                let stale = state.slots.remove(&descriptor.name);
                let victim_names = select_eviction_candidates(&state, descriptor, &self.config);
                let mut victims: Vec<Slot> = victim_names
                    .into_iter()
                    .filter_map(|n| state.slots.remove(&n))
                    .collect();
                victims.extend(stale);

                let cell: ServerCell = Arc::new(OnceCell::new());
                state.slots.insert(
                    descriptor.name.clone(),
                    Slot {
                        descriptor: descriptor.clone(),
                        cell: cell.clone(),
                        last_used: SystemTime::now(),
                        ctx_size,
                        backend: backend.to_string(),
                    },
                );
                drop(state);

                for victim in victims {
                    if let Some(Ok(handle)) = victim.cell.get() {
                        handle.write().await.stop().await.ok();
                    }
                }
                cell
            }
        };

        let paths = paths.clone();
        let descriptor_owned = descriptor.clone();
        let backend_owned = backend.to_string();
        let result = cell
            .get_or_init(|| async move {
                let mut server = WrappedServer::new(descriptor_owned);
                server
                    .spawn(&paths, ctx_size, &backend_owned)
                    .await
                    .map_err(|e| e.to_string())?;
                server
                    .wait_for_ready(Duration::from_secs(120))
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(Arc::new(RwLock::new(server)))
            })
            .await;

        match result {
            Ok(handle) => Ok(handle.clone()),
            Err(e) => {
                self.state.lock().await.slots.remove(&descriptor.name);
                Err(GatewayError::EngineFailed(e.clone()))
            }
        }
    }

    /// Stop and evict one model, or every resident model when `name` is `None`.
    pub async fn unload(&self, name: Option<&str>) -> Result<()> {
        let victims: Vec<Slot> = {
            let mut state = self.state.lock().await;
            match name {
                Some(n) => {
                    let slot = state
                        .slots
                        .remove(n)
                        .ok_or_else(|| GatewayError::NotFound(n.to_string()))?;
                    vec![slot]
                }
                None => state.slots.drain().map(|(_, s)| s).collect(),
            }
        };
        for victim in victims {
            if let Some(Ok(handle)) = victim.cell.get() {
                handle.write().await.stop().await.ok();
            }
        }
        Ok(())
    }

    pub async fn list_loaded(&self) -> Vec<LoadedInfo> {
        let state = self.state.lock().await;
        state
            .slots
            .values()
            .map(|s| LoadedInfo {
                name: s.descriptor.name.clone(),
                kind: s.descriptor.kind().to_string(),
                ready: matches!(s.cell.get(), Some(Ok(_))),
                device: if s.descriptor.requires_npu() {
                    "npu".to_string()
                } else {
                    s.backend.clone()
                },
                checkpoint: s.descriptor.checkpoint.clone(),
                last_use: s
                    .last_used
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                recipe_options: RecipeOptions {
                    ctx_size: Some(s.ctx_size),
                    llamacpp_backend: Some(s.backend.clone()),
                    llamacpp_args: None,
                },
            })
            .collect()
    }

    pub async fn all_models_loaded(&self) -> bool {
        let state = self.state.lock().await;
        !state.slots.is_empty() && state.slots.len() >= self.max_models()
    }
}

/// Whether a resident slot's recorded load options still satisfy a newly requested
/// `ctx_size`/`backend`, i.e. whether `acquire` may hand back the existing server.
fn slot_options_match(slot: &Slot, ctx_size: u32, backend: &str) -> bool {
    slot.ctx_size == ctx_size && slot.backend == backend
}

fn quota_for(config: &Config, kind: &str) -> usize {
    match kind {
        "embedding" => config.max_embedding,
        "reranking" => config.max_reranking,
        _ => config.max_llm,
    }
}

/// Which resident names must be evicted to make room for `descriptor`. Ties in
/// least-recently-used order break lexicographically on name, for deterministic behavior.
fn select_eviction_candidates(
    state: &SchedulerState,
    descriptor: &ModelDescriptor,
    config: &Config,
) -> Vec<String> {
    let mut victims = Vec::new();

    if descriptor.requires_npu() {
        for slot in state.slots.values() {
            if slot.descriptor.requires_npu() {
                victims.push(slot.descriptor.name.clone());
            }
        }
    }

    let kind = descriptor.kind();
    let quota = quota_for(config, kind);
    let mut same_kind: Vec<&Slot> = state
        .slots
        .values()
        .filter(|s| s.descriptor.kind() == kind && !victims.contains(&s.descriptor.name))
        .collect();

    if same_kind.len() + 1 > quota && quota > 0 {
        same_kind.sort_by(|a, b| {
            a.last_used
                .cmp(&b.last_used)
                .then_with(|| a.descriptor.name.cmp(&b.descriptor.name))
        });
        let excess = same_kind.len() + 1 - quota;
        for s in same_kind.into_iter().take(excess) {
            victims.push(s.descriptor.name.clone());
        }
    }

    victims
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Source;

    fn desc(name: &str, recipe: &str, labels: &[&str]) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            checkpoint: format!("org/{name}"),
            recipe: recipe.to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            mmproj: None,
            source: Source::Catalog,
            reasoning: None,
        }
    }

    fn config(max_llm: usize, max_embedding: usize, max_reranking: usize) -> Config {
        Config {
            host: "localhost".to_string(),
            port: 8000,
            log_level: "info".to_string(),
            api_key: None,
            llamacpp_backend: "cpu".to_string(),
            default_ctx_size: 4096,
            cache_dir: std::env::temp_dir(),
            max_llm,
            max_embedding,
            max_reranking,
        }
    }

    fn insert(state: &mut SchedulerState, d: ModelDescriptor, age_offset_ms: u64) {
        state.slots.insert(
            d.name.clone(),
            Slot {
                descriptor: d,
                cell: Arc::new(OnceCell::new()),
                last_used: SystemTime::now() - Duration::from_millis(age_offset_ms),
                ctx_size: 4096,
                backend: "cpu".to_string(),
            },
        );
    }

    #[test]
    fn quota_exceeded_evicts_oldest_same_kind() {
        let mut state = SchedulerState {
            slots: HashMap::new(),
        };
        insert(&mut state, desc("a", "llamacpp", &[]), 200);
        insert(&mut state, desc("b", "llamacpp", &[]), 100);
        let cfg = config(2, 1, 1);
        let victims = select_eviction_candidates(&state, &desc("c", "llamacpp", &[]), &cfg);
        assert_eq!(victims, vec!["a".to_string()]);
    }

    #[test]
    fn separate_kinds_do_not_contend() {
        let mut state = SchedulerState {
            slots: HashMap::new(),
        };
        insert(&mut state, desc("a", "llamacpp", &[]), 100);
        let cfg = config(1, 1, 1);
        let victims =
            select_eviction_candidates(&state, &desc("embed", "llamacpp", &["embedding"]), &cfg);
        assert!(victims.is_empty());
    }

    #[test]
    fn slot_options_match_requires_ctx_size_and_backend_equal() {
        let mut state = SchedulerState {
            slots: HashMap::new(),
        };
        insert(&mut state, desc("a", "llamacpp", &[]), 0);
        let slot = &state.slots["a"];
        assert!(slot_options_match(slot, 4096, "cpu"));
        assert!(!slot_options_match(slot, 8192, "cpu"));
        assert!(!slot_options_match(slot, 4096, "vulkan"));
    }

    #[test]
    fn npu_exclusivity_evicts_any_other_npu_model() {
        let mut state = SchedulerState {
            slots: HashMap::new(),
        };
        insert(&mut state, desc("flm-a", "flm", &[]), 100);
        let cfg = config(5, 5, 5);
        let victims = select_eviction_candidates(&state, &desc("flm-b", "flm", &[]), &cfg);
        assert_eq!(victims, vec!["flm-a".to_string()]);
    }

    #[tokio::test]
    async fn acquire_failure_does_not_leave_a_dangling_slot() {
        let scheduler = ModelScheduler::new(config(2, 1, 1));
        let d = desc("missing-binary", "llamacpp", &[]);
        let paths = LocalPaths {
            primary: std::env::temp_dir().join("does-not-exist.gguf"),
            siblings: vec![],
            mmproj: None,
        };
        let err = scheduler.acquire(&d, &paths, 4096, "cpu").await;
        assert!(err.is_err());
        assert!(scheduler.list_loaded().await.is_empty());
    }

    #[tokio::test]
    async fn unload_missing_name_errors_not_found() {
        let scheduler = ModelScheduler::new(config(2, 1, 1));
        let err = scheduler.unload(Some("nope")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
