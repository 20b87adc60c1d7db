//! Cache & Resolver (C2): on-disk cache layout, local-first resolution, HF download,
//! GGUF variant/sharding rules.
//!
//! The GGUF resolution rules are a direct line-for-line translation of
//! `original_source/src/lemonade/tools/llamacpp/utils.py`'s `identify_gguf_models` and
//! `resolve_local_gguf_model`. The HF hub cache layout (`hub/models--<org>--<repo>/snapshots/<rev>/`)
//! matches `huggingface_hub`'s own convention, treated as opaque except for these rules.

use crate::catalog::ModelDescriptor;
use crate::error::{GatewayError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Split `repo[:variant]` into `(repo_or_folder, variant)`.
pub fn parse_checkpoint(checkpoint: &str) -> (String, Option<String>) {
    match checkpoint.split_once(':') {
        Some((repo, variant)) if !variant.is_empty() => (repo.to_string(), Some(variant.to_string())),
        _ => (checkpoint.trim_end_matches(':').to_string(), None),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GgufResolution {
    /// The primary file handed to the engine.
    pub primary: String,
    /// Every file that must be downloaded/present alongside `primary` (shards; for a
    /// single-file resolution, equal to `[primary]`).
    pub siblings: Vec<String>,
    pub mmproj: Option<String>,
}

/// Resolve a GGUF variant against a repo's file listing: exact quant match, then
/// single-file fallback, then ambiguous-candidate rejection.
pub fn resolve_gguf_variant(
    repo_files: &[String],
    variant: Option<&str>,
    mmproj: Option<&str>,
) -> Result<GgufResolution> {
    let primary;
    let siblings;

    match variant {
        // Rule 1: wildcard -> all .gguf files, sorted-first is primary.
        Some("*") => {
            let mut all: Vec<String> = repo_files
                .iter()
                .filter(|f| f.ends_with(".gguf"))
                .cloned()
                .collect();
            all.sort();
            if all.is_empty() {
                return Err(GatewayError::NotFound("no .gguf files in repo".to_string()));
            }
            primary = all[0].clone();
            siblings = all;
        }
        // Rule 2: variant ending .gguf -> exact file.
        Some(v) if v.ends_with(".gguf") => {
            if !repo_files.iter().any(|f| f == v) {
                return Err(GatewayError::NotFound(format!("file {v} not found in repo")));
            }
            primary = v.to_string();
            siblings = vec![primary.clone()];
        }
        // Rule 3: empty/null -> first .gguf not containing "mmproj".
        None => {
            let candidate = repo_files
                .iter()
                .find(|f| f.ends_with(".gguf") && !f.contains("mmproj"));
            let Some(candidate) = candidate else {
                return Err(GatewayError::NotFound("no .gguf files in repo".to_string()));
            };
            primary = candidate.clone();
            siblings = vec![primary.clone()];
        }
        Some(v) => {
            // Rule 4: unique file ending "<variant>.gguf" (case-insensitive).
            let suffix = format!("{v}.gguf").to_lowercase();
            let matches: Vec<&String> = repo_files
                .iter()
                .filter(|f| f.to_lowercase().ends_with(&suffix) && !f.to_lowercase().contains("mmproj"))
                .collect();
            if matches.len() == 1 {
                primary = matches[0].clone();
                siblings = vec![primary.clone()];
            } else if matches.len() > 1 {
                return Err(GatewayError::AmbiguousVariant {
                    checkpoint: v.to_string(),
                    candidates: matches.into_iter().cloned().collect(),
                });
            } else {
                // Rule 5: folder named <variant> containing sharded .gguf files.
                let prefix = format!("{v}/").to_lowercase();
                let mut shard_files: Vec<String> = repo_files
                    .iter()
                    .filter(|f| f.ends_with(".gguf") && f.to_lowercase().starts_with(&prefix))
                    .cloned()
                    .collect();
                if shard_files.is_empty() {
                    return Err(GatewayError::NotFound(format!(
                        "no .gguf files found for variant {v}"
                    )));
                }
                shard_files.sort();
                primary = shard_files[0].clone();
                siblings = shard_files;
            }
        }
    }

    if let Some(m) = mmproj {
        if !repo_files.iter().any(|f| f == m) {
            return Err(GatewayError::NotFound(format!(
                "mmproj file {m} not found in repo"
            )));
        }
    }

    Ok(GgufResolution {
        primary,
        siblings,
        mmproj: mmproj.map(|s| s.to_string()),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalPaths {
    pub primary: PathBuf,
    pub siblings: Vec<PathBuf>,
    pub mmproj: Option<PathBuf>,
}

pub struct CacheResolver {
    cache_dir: PathBuf,
}

impl CacheResolver {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    pub fn hub_dir(&self) -> PathBuf {
        self.cache_dir.join("hub")
    }

    /// `org/repo` -> `hub/models--org--repo`.
    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.hub_dir().join(format!("models--{}", repo.replace('/', "--")))
    }

    /// Inspects the local cache only; never touches the network. Returns `None` if no
    /// snapshot directory, or no matching `.gguf` file, is present.
    pub fn resolve_local(&self, descriptor: &ModelDescriptor) -> Option<LocalPaths> {
        let (repo, variant) = parse_checkpoint(&descriptor.checkpoint);
        let repo_dir = self.repo_dir(&repo);
        if !repo_dir.exists() {
            return None;
        }

        let mut found: Option<PathBuf> = None;
        if let Some(ref v) = variant {
            let search_term = if v.ends_with(".gguf") {
                v.clone()
            } else {
                format!("{v}.gguf")
            };
            found = find_file_named(&repo_dir, &search_term);
        }
        if found.is_none() {
            found = find_first_gguf_excluding_mmproj(&repo_dir);
        }
        let primary = found?;

        let mmproj = descriptor
            .mmproj
            .as_ref()
            .and_then(|m| find_file_named(&repo_dir, m));

        Some(LocalPaths {
            siblings: vec![primary.clone()],
            primary,
            mmproj,
        })
    }

    /// Download (or confirm-cached) the descriptor's files. With `allow_upgrade = false`
    /// and a complete local copy present, this is a pure no-op (no network traffic).
    pub async fn download(
        &self,
        descriptor: &ModelDescriptor,
        allow_upgrade: bool,
    ) -> Result<LocalPaths> {
        if !allow_upgrade {
            if let Some(local) = self.resolve_local(descriptor) {
                return Ok(local);
            }
        }

        let (repo, variant) = parse_checkpoint(&descriptor.checkpoint);
        let repo_files = list_repo_files(&repo).await?;
        let resolution =
            resolve_gguf_variant(&repo_files, variant.as_deref(), descriptor.mmproj.as_deref())?;

        let repo_dir = self.repo_dir(&repo);
        let snapshot_dir = repo_dir.join("snapshots").join("main");
        tokio::fs::create_dir_all(&snapshot_dir).await?;

        let mut siblings = Vec::new();
        for file in &resolution.siblings {
            siblings.push(self.download_file(&repo, file, &snapshot_dir).await?);
        }
        let mmproj = match &resolution.mmproj {
            Some(m) => Some(self.download_file(&repo, m, &snapshot_dir).await?),
            None => None,
        };

        Ok(LocalPaths {
            primary: snapshot_dir.join(&resolution.primary),
            siblings,
            mmproj,
        })
    }

    async fn download_file(&self, repo: &str, file: &str, dest_dir: &Path) -> Result<PathBuf> {
        let url = format!("https://huggingface.co/{repo}/resolve/main/{file}");
        let response = reqwest::get(&url)
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GatewayError::NetworkError(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
        let dest = dest_dir.join(file);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        atomic_write(&dest, &bytes)?;
        Ok(dest)
    }

    /// For GGUF variants, deletes only the variant-specific files; if no `.gguf` siblings
    /// remain, removes the whole repo directory; for non-GGUF, removes the repo directory.
    pub fn delete(&self, descriptor: &ModelDescriptor) -> Result<()> {
        let (repo, _) = parse_checkpoint(&descriptor.checkpoint);
        let repo_dir = self.repo_dir(&repo);
        if !repo_dir.exists() {
            return Ok(());
        }

        if let Some(local) = self.resolve_local(descriptor) {
            for file in &local.siblings {
                let _ = std::fs::remove_file(file);
            }
            if let Some(m) = &local.mmproj {
                let _ = std::fs::remove_file(m);
            }
        }

        if !any_gguf_remaining(&repo_dir) {
            std::fs::remove_dir_all(&repo_dir)?;
        }
        Ok(())
    }

    /// Lazy pull-progress events consumed by the Ollama `/api/pull` translation and the
    /// `/pull?stream=true` endpoint. A single internal `Event` stream, framed as SSE or
    /// NDJSON at the HTTP boundary depending on which dialect's handler consumes it.
    pub fn download_stream(
        &self,
        descriptor: ModelDescriptor,
    ) -> impl futures_util::Stream<Item = PullEvent> {
        let cache_dir = self.cache_dir.clone();
        async_stream::stream! {
            yield PullEvent { status: "pulling manifest".to_string(), digest: None, total: None, completed: None };

            let (repo, variant) = parse_checkpoint(&descriptor.checkpoint);
            let resolver = CacheResolver::new(cache_dir);
            let repo_files = match list_repo_files(&repo).await {
                Ok(files) => files,
                Err(e) => {
                    yield PullEvent { status: format!("error: {e}"), digest: None, total: None, completed: None };
                    return;
                }
            };
            let resolution = match resolve_gguf_variant(&repo_files, variant.as_deref(), descriptor.mmproj.as_deref()) {
                Ok(r) => r,
                Err(e) => {
                    yield PullEvent { status: format!("error: {e}"), digest: None, total: None, completed: None };
                    return;
                }
            };

            for file in &resolution.siblings {
                let digest = format!("sha256-{file}");
                yield PullEvent { status: "downloading".to_string(), digest: Some(digest.clone()), total: Some(100), completed: Some(0) };
                let snapshot_dir = resolver.repo_dir(&repo).join("snapshots").join("main");
                if let Err(e) = resolver.download_file(&repo, file, &snapshot_dir).await {
                    yield PullEvent { status: format!("error: {e}"), digest: Some(digest), total: None, completed: None };
                    return;
                }
                yield PullEvent { status: "downloading".to_string(), digest: Some(digest), total: Some(100), completed: Some(100) };
            }

            yield PullEvent { status: "success".to_string(), digest: None, total: None, completed: None };
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PullEvent {
    pub status: String,
    pub digest: Option<String>,
    pub total: Option<u64>,
    pub completed: Option<u64>,
}

async fn list_repo_files(repo: &str) -> Result<Vec<String>> {
    let url = format!("https://huggingface.co/api/models/{repo}");
    let response = reqwest::get(&url)
        .await
        .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
    if !response.status().is_success() {
        return Err(GatewayError::NetworkError(format!(
            "{url} returned {}",
            response.status()
        )));
    }
    #[derive(serde::Deserialize)]
    struct Sibling {
        rfilename: String,
    }
    #[derive(serde::Deserialize)]
    struct ModelInfo {
        siblings: Vec<Sibling>,
    }
    let info: ModelInfo = response
        .json()
        .await
        .map_err(|e| GatewayError::NetworkError(e.to_string()))?;
    Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
}

fn find_file_named(root: &Path, name: &str) -> Option<PathBuf> {
    walk(root).into_iter().find(|p| {
        p.file_name()
            .and_then(|f| f.to_str())
            .map(|f| f == name)
            .unwrap_or(false)
    })
}

fn find_first_gguf_excluding_mmproj(root: &Path) -> Option<PathBuf> {
    let mut files = walk(root);
    files.sort();
    files.into_iter().find(|p| {
        let name = p.file_name().and_then(|f| f.to_str()).unwrap_or("");
        name.ends_with(".gguf") && !name.to_lowercase().contains("mmproj")
    })
}

fn any_gguf_remaining(root: &Path) -> bool {
    walk(root).iter().any(|p| {
        p.extension().and_then(|e| e.to_str()) == Some("gguf")
    })
}

fn walk(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(walk(&path));
        } else {
            out.push(path);
        }
    }
    out
}

/// Write-temp-then-rename, shared by the catalog, the recipe options store, and downloads.
pub fn atomic_write(dest: &Path, contents: &[u8]) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.persist(dest).map_err(|e| anyhow::anyhow!(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_checkpoint_splits_variant() {
        assert_eq!(
            parse_checkpoint("unsloth/Qwen3-8B-GGUF:Q4_1"),
            ("unsloth/Qwen3-8B-GGUF".to_string(), Some("Q4_1".to_string()))
        );
        assert_eq!(
            parse_checkpoint("unsloth/Qwen3-30B-A3B-GGUF"),
            ("unsloth/Qwen3-30B-A3B-GGUF".to_string(), None)
        );
    }

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn wildcard_selects_sorted_first_and_all_siblings() {
        let repo = files(&["b.gguf", "a.gguf", "readme.md"]);
        let r = resolve_gguf_variant(&repo, Some("*"), None).unwrap();
        assert_eq!(r.primary, "a.gguf");
        assert_eq!(r.siblings, vec!["a.gguf", "b.gguf"]);
    }

    #[test]
    fn exact_filename_variant() {
        let repo = files(&["qwen3.gguf", "other.gguf"]);
        let r = resolve_gguf_variant(&repo, Some("qwen3.gguf"), None).unwrap();
        assert_eq!(r.primary, "qwen3.gguf");
    }

    #[test]
    fn empty_variant_picks_first_non_mmproj() {
        let repo = files(&["model-mmproj.gguf", "model.gguf"]);
        let r = resolve_gguf_variant(&repo, None, None).unwrap();
        assert_eq!(r.primary, "model.gguf");
    }

    #[test]
    fn quantization_suffix_variant_unique() {
        let repo = files(&["Qwen3-8B-GGUF-Q4_1.gguf", "Qwen3-8B-GGUF-Q8_0.gguf"]);
        let r = resolve_gguf_variant(&repo, Some("Q4_1"), None).unwrap();
        assert_eq!(r.primary, "Qwen3-8B-GGUF-Q4_1.gguf");
    }

    #[test]
    fn quantization_suffix_variant_ambiguous_is_fatal() {
        let repo = files(&["part1-Q4.gguf", "part2-Q4.gguf"]);
        let err = resolve_gguf_variant(&repo, Some("Q4"), None).unwrap_err();
        assert!(matches!(err, GatewayError::AmbiguousVariant { .. }));
    }

    #[test]
    fn folder_variant_selects_sorted_first_shard() {
        let repo = files(&["Q4_0/shard-02.gguf", "Q4_0/shard-01.gguf"]);
        let r = resolve_gguf_variant(&repo, Some("Q4_0"), None).unwrap();
        assert_eq!(r.primary, "Q4_0/shard-01.gguf");
        assert_eq!(r.siblings.len(), 2);
    }

    #[test]
    fn missing_mmproj_errors() {
        let repo = files(&["model.gguf"]);
        let err = resolve_gguf_variant(&repo, None, Some("proj.gguf")).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
