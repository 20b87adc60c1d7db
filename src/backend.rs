//! Backend/GPU detection (C3). A single probe at startup, cached on [`Supervisor`](crate::supervisor::Supervisor)
//! and reused by the catalog's platform filter and the llama.cpp-style wrapped server.
//!
//! Grounded on `Rauxon-sovereign-engine/proxy/src/docker/mod.rs`'s `detect_gpu`/sysfs/`nvidia-smi`
//! probing and shimmy's `engine/llama.rs` `GpuBackend::detect_best()`, translated off both
//! Docker and in-process FFI onto plain `sysinfo` + probe-subprocess primitives.

use serde::Serialize;
use std::process::Command;

#[derive(Debug, Clone, Serialize, Default)]
pub struct BackendInfo {
    pub cpu: String,
    pub amd_igpu: Option<String>,
    pub amd_dgpu: Vec<GpuDevice>,
    pub nvidia_dgpu: Vec<GpuDevice>,
    pub npu: Option<String>,
    pub default_llamacpp_backend: String,
    /// `(major, minor)`, macOS only. Gates catalog visibility: the wrapped engines require
    /// macOS 14+.
    pub macos_version: Option<(u32, u32)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuDevice {
    pub name: String,
    pub driver_version: Option<String>,
    /// ROCm architecture family (gfx110X / gfx120X / gfx1151), AMD discrete only.
    pub rocm_arch: Option<String>,
}

impl BackendInfo {
    pub fn has_ryzenai_runtime(&self) -> bool {
        std::env::var("LEMONADE_RYZENAI_RUNTIME").is_ok()
    }

    pub fn has_npu(&self) -> bool {
        self.npu.is_some()
    }
}

/// Probe host hardware once. Never fails outright: a probe step that errors degrades to
/// "device absent" rather than aborting startup, since backend detection only informs
/// defaults and catalog visibility, never a hard requirement.
pub fn detect() -> BackendInfo {
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu();
    let cpu = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let nvidia_dgpu = detect_nvidia();
    let (amd_igpu, amd_dgpu) = detect_amd();
    let npu = detect_npu();
    let macos_version = if cfg!(target_os = "macos") {
        detect_macos_version()
    } else {
        None
    };

    BackendInfo {
        cpu,
        amd_igpu,
        amd_dgpu,
        nvidia_dgpu,
        npu,
        default_llamacpp_backend: default_llamacpp_backend(),
        macos_version,
    }
}

fn default_llamacpp_backend() -> String {
    if let Ok(explicit) = std::env::var("LEMONADE_LLAMACPP") {
        return explicit;
    }
    if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
        "metal".to_string()
    } else {
        "vulkan".to_string()
    }
}

fn detect_nvidia() -> Vec<GpuDevice> {
    let Ok(output) = Command::new("nvidia-smi")
        .args(["--query-gpu=name,driver_version", "--format=csv,noheader"])
        .output()
    else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(2, ", ");
            let name = parts.next()?.trim().to_string();
            let driver_version = parts.next().map(|s| s.trim().to_string());
            Some(GpuDevice {
                name,
                driver_version,
                rocm_arch: None,
            })
        })
        .collect()
}

/// AMD detection is keyword-based on the device name string rather than a PCI-ID table,
/// for robustness against generic driver-reported names.
fn detect_amd() -> (Option<String>, Vec<GpuDevice>) {
    let Ok(output) = Command::new("lspci").output() else {
        return (None, Vec::new());
    };
    if !output.status.success() {
        return (None, Vec::new());
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut igpu = None;
    let mut dgpus = Vec::new();
    for line in text.lines() {
        let lower = line.to_lowercase();
        if !lower.contains("amd") && !lower.contains("advanced micro devices") {
            continue;
        }
        if !lower.contains("vga") && !lower.contains("display") && !lower.contains("3d") {
            continue;
        }
        let name = line.split_once(": ").map(|x| x.1).unwrap_or(line).to_string();
        if is_discrete_amd(&lower) {
            dgpus.push(GpuDevice {
                rocm_arch: classify_rocm_arch(&lower),
                name,
                driver_version: None,
            });
        } else {
            igpu = Some(name);
        }
    }
    (igpu, dgpus)
}

fn is_discrete_amd(lower_name: &str) -> bool {
    ["rx ", "radeon pro", "instinct", "w7", "w6"]
        .iter()
        .any(|kw| lower_name.contains(kw))
}

/// Keyword table classifying an AMD discrete device name into a ROCm architecture family.
fn classify_rocm_arch(lower_name: &str) -> Option<String> {
    const GFX110X: &[&str] = &["rx 7900", "rx 7800", "rx 7700", "w7900", "w7800"];
    const GFX120X: &[&str] = &["rx 9070", "rx 9060"];
    const GFX1151: &[&str] = &["8060s", "8050s", "ryzen ai max"];

    if GFX110X.iter().any(|kw| lower_name.contains(kw)) {
        Some("gfx110X".to_string())
    } else if GFX120X.iter().any(|kw| lower_name.contains(kw)) {
        Some("gfx120X".to_string())
    } else if GFX1151.iter().any(|kw| lower_name.contains(kw)) {
        Some("gfx1151".to_string())
    } else {
        None
    }
}

/// `sw_vers -productVersion` prints e.g. `14.5`; parsed into `(major, minor)`.
fn detect_macos_version() -> Option<(u32, u32)> {
    let output = Command::new("sw_vers").arg("-productVersion").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut parts = text.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    Some((major, minor))
}

fn detect_npu() -> Option<String> {
    let Ok(output) = Command::new("lspci").output() else {
        return None;
    };
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .find(|line| {
            let lower = line.to_lowercase();
            lower.contains("ryzen ai") || lower.contains("ipu") || lower.contains("npu")
        })
        .map(|line| line.split_once(": ").map(|x| x.1).unwrap_or(line).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rocm_arch_classification() {
        assert_eq!(
            classify_rocm_arch("amd radeon rx 7900 xtx"),
            Some("gfx110X".to_string())
        );
        assert_eq!(
            classify_rocm_arch("amd radeon rx 9070 xt"),
            Some("gfx120X".to_string())
        );
        assert_eq!(
            classify_rocm_arch("ryzen ai max+ 395 w/ radeon 8060s graphics"),
            Some("gfx1151".to_string())
        );
        assert_eq!(classify_rocm_arch("amd radeon vega 8"), None);
    }

    #[test]
    fn discrete_vs_integrated() {
        assert!(is_discrete_amd("amd radeon rx 7900 xtx"));
        assert!(!is_discrete_amd("amd radeon graphics"));
    }

    #[test]
    #[serial_test::serial]
    fn default_backend_respects_env() {
        std::env::set_var("LEMONADE_LLAMACPP", "cpu");
        assert_eq!(default_llamacpp_backend(), "cpu");
        std::env::remove_var("LEMONADE_LLAMACPP");
    }
}
