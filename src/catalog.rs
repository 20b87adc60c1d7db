//! Model Catalog (C1): merges the bundled read-only descriptor map with the
//! user-writable one, applies platform filtering, and resolves names to descriptors.
//!
//! Grounded on `original_source/src/lemonade_server/model_manager.py`
//! (`ModelManager.supported_models`: JSON-file merge, `user.` namespacing, the legacy
//! boolean-`reasoning`-to-`labels` migration) and shimmy's registry-over-a-merged-map shape.

use crate::backend::BackendInfo;
use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const BUNDLED_CATALOG: &str = include_str!("../assets/server_models.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    #[default]
    Catalog,
    LocalUpload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub name: String,
    pub checkpoint: String,
    pub recipe: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub mmproj: Option<String>,
    #[serde(default)]
    pub source: Source,
    /// Legacy boolean form kept for wire/back-compat; migrated into `labels` on load.
    #[serde(default, skip_serializing)]
    pub(crate) reasoning: Option<bool>,
}

impl ModelDescriptor {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Derived load type: explicit `embedding`/`reranking` labels win, else recipe-derived
    /// (`whispercpp` → audio, `sd-cpp`/`kokoro` → image), else `llm`.
    pub fn kind(&self) -> &'static str {
        if self.has_label("embedding") {
            "embedding"
        } else if self.has_label("reranking") {
            "reranking"
        } else if self.recipe == "whispercpp" {
            "audio"
        } else if self.recipe == "sd-cpp" {
            "image"
        } else {
            "llm"
        }
    }

    pub fn requires_npu(&self) -> bool {
        self.recipe == "flm" || self.recipe.starts_with("ryzenai")
    }

    fn migrate_legacy_reasoning(&mut self) {
        if let Some(true) = self.reasoning.take() {
            if !self.has_label("reasoning") {
                self.labels.push("reasoning".to_string());
            }
        }
    }
}

/// macOS on anything but Apple Silicon can run none of the wrapped engines; macOS older
/// than 14 is rejected with the OS version in the error so the caller can relay it.
fn check_macos_supported(is_macos: bool, is_aarch64: bool, macos_version: Option<(u32, u32)>) -> Result<()> {
    if !is_macos {
        return Ok(());
    }
    if !is_aarch64 {
        return Err(GatewayError::UnsupportedPlatform(
            "macOS on non-Apple-Silicon is not supported".to_string(),
        ));
    }
    if let Some((major, minor)) = macos_version {
        if major < 14 {
            return Err(GatewayError::UnsupportedPlatform(format!(
                "macOS {major}.{minor} detected; macOS 14 or later is required"
            )));
        }
    }
    Ok(())
}

pub struct Catalog {
    bundled: HashMap<String, ModelDescriptor>,
    user: HashMap<String, ModelDescriptor>,
    user_models_path: std::path::PathBuf,
}

impl Catalog {
    pub fn load(cache_dir: &Path) -> Result<Self> {
        let mut bundled: HashMap<String, ModelDescriptor> =
            serde_json::from_str(BUNDLED_CATALOG).map_err(|e| anyhow::anyhow!(e))?;
        for (name, desc) in bundled.iter_mut() {
            desc.name = name.clone();
            desc.migrate_legacy_reasoning();
        }

        let user_models_path = cache_dir.join("user_models.json");
        let user = if user_models_path.exists() {
            let text = fs::read_to_string(&user_models_path)?;
            let raw: HashMap<String, ModelDescriptor> =
                serde_json::from_str(&text).map_err(|e| anyhow::anyhow!(e))?;
            raw.into_iter()
                .map(|(name, mut desc)| {
                    let namespaced = format!("user.{name}");
                    desc.name = namespaced.clone();
                    desc.source = Source::LocalUpload;
                    desc.migrate_legacy_reasoning();
                    (namespaced, desc)
                })
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            bundled,
            user,
            user_models_path,
        })
    }

    pub fn lookup(&self, name: &str) -> Option<&ModelDescriptor> {
        self.user.get(name).or_else(|| self.bundled.get(name))
    }

    /// All descriptors, bundled ∪ user, filtered by platform: non-ARM64 macOS and macOS
    /// older than 14 can run none of the wrapped engines and surface a structured
    /// `UnsupportedPlatform` error rather than just an empty catalog; elsewhere, recipes
    /// requiring hardware the host doesn't have (NPU, Ryzen AI runtime) are hidden.
    pub fn filter_enabled(&self, backend: &BackendInfo) -> Result<HashMap<String, ModelDescriptor>> {
        check_macos_supported(cfg!(target_os = "macos"), cfg!(target_arch = "aarch64"), backend.macos_version)?;

        if cfg!(target_os = "macos") {
            return Ok(self
                .all()
                .into_iter()
                .filter(|(_, d)| d.recipe == "llamacpp")
                .collect());
        }

        Ok(self
            .all()
            .into_iter()
            .filter(|(_, d)| {
                if d.recipe.starts_with("ryzenai") && !backend.has_ryzenai_runtime() {
                    return false;
                }
                if d.recipe == "flm" && !backend.has_npu() {
                    return false;
                }
                true
            })
            .collect())
    }

    fn all(&self) -> HashMap<String, ModelDescriptor> {
        let mut merged = self.bundled.clone();
        merged.extend(self.user.clone());
        merged
    }

    /// Register a new user model. Fails with `Conflict` if a differing descriptor already
    /// exists under the same name (compared on checkpoint, recipe, labels, mmproj).
    pub fn register(&mut self, mut descriptor: ModelDescriptor) -> Result<()> {
        if !descriptor.name.starts_with("user.") {
            descriptor.name = format!("user.{}", descriptor.name);
        }
        descriptor.source = Source::LocalUpload;

        if let Some(existing) = self.user.get(&descriptor.name) {
            if existing.checkpoint != descriptor.checkpoint
                || existing.recipe != descriptor.recipe
                || existing.labels != descriptor.labels
                || existing.mmproj != descriptor.mmproj
            {
                return Err(GatewayError::Conflict {
                    name: descriptor.name.clone(),
                    detail: "differing checkpoint/recipe/labels/mmproj".to_string(),
                });
            }
            return Ok(());
        }

        self.user.insert(descriptor.name.clone(), descriptor);
        self.persist_user_models()
    }

    pub fn delete(&mut self, name: &str) -> Result<()> {
        if self.user.remove(name).is_none() {
            return Err(GatewayError::NotFound(name.to_string()));
        }
        self.persist_user_models()
    }

    fn persist_user_models(&self) -> Result<()> {
        // Strip the `user.` prefix back off for the on-disk representation, matching the
        // original's namespace-at-merge-time (not namespace-at-storage-time) convention.
        let unprefixed: HashMap<String, &ModelDescriptor> = self
            .user
            .iter()
            .map(|(name, desc)| (name.trim_start_matches("user.").to_string(), desc))
            .collect();
        let json = serde_json::to_string_pretty(&unprefixed).map_err(|e| anyhow::anyhow!(e))?;
        crate::cache::atomic_write(&self.user_models_path, json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bundled_catalog_parses_and_self_names() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::load(dir.path()).unwrap();
        let desc = catalog.lookup("LFM2-1.2B-GGUF").unwrap();
        assert_eq!(desc.name, "LFM2-1.2B-GGUF");
        assert_eq!(desc.recipe, "llamacpp");
    }

    #[test]
    fn lookup_name_matches_every_entry() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::load(dir.path()).unwrap();
        for (name, _) in catalog.all() {
            assert_eq!(catalog.lookup(&name).unwrap().name, name);
        }
    }

    #[test]
    fn register_namespaces_and_persists() {
        let dir = tempdir().unwrap();
        let mut catalog = Catalog::load(dir.path()).unwrap();
        catalog
            .register(ModelDescriptor {
                name: "Foo".to_string(),
                checkpoint: "org/Repo-GGUF:Q4".to_string(),
                recipe: "llamacpp".to_string(),
                labels: vec![],
                mmproj: None,
                source: Source::Catalog,
                reasoning: None,
            })
            .unwrap();
        assert!(catalog.lookup("user.Foo").is_some());
        assert!(dir.path().join("user_models.json").exists());
    }

    #[test]
    fn register_conflict_rejected() {
        let dir = tempdir().unwrap();
        let mut catalog = Catalog::load(dir.path()).unwrap();
        let base = ModelDescriptor {
            name: "Foo".to_string(),
            checkpoint: "org/Repo-GGUF:Q4".to_string(),
            recipe: "llamacpp".to_string(),
            labels: vec![],
            mmproj: None,
            source: Source::Catalog,
            reasoning: None,
        };
        catalog.register(base.clone()).unwrap();
        let mut differing = base;
        differing.checkpoint = "org/Repo-GGUF:Q8".to_string();
        let err = catalog.register(differing).unwrap_err();
        assert!(matches!(err, GatewayError::Conflict { .. }));
    }

    #[test]
    fn legacy_reasoning_boolean_migrates_to_label() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("user_models.json"),
            r#"{"Old":{"checkpoint":"org/Old-GGUF","recipe":"llamacpp","reasoning":true}}"#,
        )
        .unwrap();
        let catalog = Catalog::load(dir.path()).unwrap();
        let desc = catalog.lookup("user.Old").unwrap();
        assert!(desc.has_label("reasoning"));
    }

    #[test]
    fn macos_non_aarch64_is_rejected() {
        let err = check_macos_supported(true, false, None).unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedPlatform(_)));
    }

    #[test]
    fn macos_below_14_is_rejected_with_version_detail() {
        let err = check_macos_supported(true, true, Some((13, 2))).unwrap_err();
        assert!(matches!(&err, GatewayError::UnsupportedPlatform(detail) if detail.contains("13.2")));
    }

    #[test]
    fn macos_14_and_above_is_supported() {
        assert!(check_macos_supported(true, true, Some((14, 0))).is_ok());
    }

    #[test]
    fn non_macos_is_always_supported() {
        assert!(check_macos_supported(false, false, None).is_ok());
    }

    #[test]
    fn flm_hidden_without_npu() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::load(dir.path()).unwrap();
        let backend = BackendInfo::default();
        let enabled = catalog.filter_enabled(&backend).unwrap();
        assert!(!enabled.contains_key("Llama-3.2-1B-flm"));
    }
}
