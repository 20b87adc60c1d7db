//! Process-wide configuration, read once at startup from the `LEMONADE_*`/`HF_*`
//! environment variables into one typed struct.

use std::path::PathBuf;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_CTX_SIZE: u32 = 4096;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub api_key: Option<String>,
    pub llamacpp_backend: String,
    pub default_ctx_size: u32,
    pub cache_dir: PathBuf,
    pub max_llm: usize,
    pub max_embedding: usize,
    pub max_reranking: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("LEMONADE_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port: std::env::var("LEMONADE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            log_level: std::env::var("LEMONADE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            api_key: std::env::var("LEMONADE_API_KEY").ok().filter(|s| !s.is_empty()),
            llamacpp_backend: std::env::var("LEMONADE_LLAMACPP")
                .unwrap_or_else(|_| default_llamacpp_backend()),
            default_ctx_size: std::env::var("LEMONADE_CTX_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CTX_SIZE),
            cache_dir: cache_dir_from_env(),
            max_llm: std::env::var("LEMONADE_MAX_LLM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            max_embedding: std::env::var("LEMONADE_MAX_EMBEDDING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            max_reranking: std::env::var("LEMONADE_MAX_RERANKING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
        }
    }
}

/// `metal` on Apple Silicon, `vulkan` everywhere else; overridable by `LEMONADE_LLAMACPP`.
fn default_llamacpp_backend() -> String {
    if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
        "metal".to_string()
    } else {
        "vulkan".to_string()
    }
}

/// `LEMONADE_CACHE_DIR`, else `HF_HOME`, else `HF_HUB_CACHE`, else `~/.cache/lemonade`.
fn cache_dir_from_env() -> PathBuf {
    if let Ok(dir) = std::env::var("LEMONADE_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("HF_HOME") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("HF_HUB_CACHE") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("lemonade")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_without_env() {
        for var in [
            "LEMONADE_HOST",
            "LEMONADE_PORT",
            "LEMONADE_API_KEY",
            "LEMONADE_LLAMACPP",
            "LEMONADE_CTX_SIZE",
            "LEMONADE_CACHE_DIR",
            "HF_HOME",
            "HF_HUB_CACHE",
        ] {
            std::env::remove_var(var);
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.default_ctx_size, DEFAULT_CTX_SIZE);
        assert!(cfg.api_key.is_none());
    }

    #[test]
    #[serial]
    fn reads_overrides() {
        std::env::set_var("LEMONADE_PORT", "9999");
        std::env::set_var("LEMONADE_API_KEY", "secret");
        let cfg = Config::from_env();
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.api_key.as_deref(), Some("secret"));
        std::env::remove_var("LEMONADE_PORT");
        std::env::remove_var("LEMONADE_API_KEY");
    }

    #[test]
    #[serial]
    fn empty_api_key_is_none() {
        std::env::set_var("LEMONADE_API_KEY", "");
        let cfg = Config::from_env();
        assert!(cfg.api_key.is_none());
        std::env::remove_var("LEMONADE_API_KEY");
    }
}
