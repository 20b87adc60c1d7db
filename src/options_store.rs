//! Recipe Options Store (C8): per-model persisted load options, atomic write, read-modify-write
//! protected by its own mutex (kept separate from the scheduler's mutex so saving options
//! never contends with model residency bookkeeping).

use crate::cache::atomic_write;
use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llamacpp_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llamacpp_args: Option<String>,
}

pub struct OptionsStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, RecipeOptions>>,
}

impl OptionsStore {
    pub fn load(cache_dir: &std::path::Path) -> Result<Self> {
        let path = cache_dir.join("recipe_options.json");
        let entries = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).map_err(|e| anyhow::anyhow!(e))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn get(&self, name: &str) -> Option<RecipeOptions> {
        self.entries.lock().get(name).cloned()
    }

    /// Merge `options` into the stored record for `name` and persist atomically.
    pub fn save(&self, name: &str, options: RecipeOptions) -> Result<()> {
        let mut entries = self.entries.lock();
        let merged = match entries.get(name) {
            Some(existing) => RecipeOptions {
                ctx_size: options.ctx_size.or(existing.ctx_size),
                llamacpp_backend: options.llamacpp_backend.or_else(|| existing.llamacpp_backend.clone()),
                llamacpp_args: options.llamacpp_args.or_else(|| existing.llamacpp_args.clone()),
            },
            None => options,
        };
        entries.insert(name.to_string(), merged);
        let json = serde_json::to_string_pretty(&*entries).map_err(|e| anyhow::anyhow!(e))?;
        atomic_write(&self.path, json.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_byte_equivalent() {
        let dir = tempdir().unwrap();
        let store = OptionsStore::load(dir.path()).unwrap();
        let opts = RecipeOptions {
            ctx_size: Some(8192),
            llamacpp_backend: Some("vulkan".to_string()),
            llamacpp_args: None,
        };
        store.save("Qwen3-0.6B-GGUF", opts.clone()).unwrap();

        let reloaded = OptionsStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("Qwen3-0.6B-GGUF"), Some(opts));
    }

    #[test]
    fn save_merges_rather_than_overwrites() {
        let dir = tempdir().unwrap();
        let store = OptionsStore::load(dir.path()).unwrap();
        store
            .save(
                "m",
                RecipeOptions {
                    ctx_size: Some(4096),
                    llamacpp_backend: None,
                    llamacpp_args: None,
                },
            )
            .unwrap();
        store
            .save(
                "m",
                RecipeOptions {
                    ctx_size: None,
                    llamacpp_backend: Some("cpu".to_string()),
                    llamacpp_args: None,
                },
            )
            .unwrap();
        let merged = store.get("m").unwrap();
        assert_eq!(merged.ctx_size, Some(4096));
        assert_eq!(merged.llamacpp_backend.as_deref(), Some("cpu"));
    }
}
