//! Compute device selection for the embedder.
//!
//! The accelerator only ever hosts ONNX inference. The flat index stays in host memory on
//! every device, so search results and the on-disk index format do not depend on this choice.

use crate::error::{Result, VectorStoreError};
use ort::execution_providers::{CUDAExecutionProvider, ExecutionProvider};
use serde::Serialize;
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const ORT_PROVIDER_SO: &str = "libonnxruntime_providers_cuda.so";
const CUBLAS_CANDIDATES: &[&str] = &[
    "libcublasLt.so.12",
    "libcublasLt.so.13",
    "libcublas.so.12",
    "libcublas.so.13",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Use CUDA when the execution provider loads, otherwise the host CPU.
    #[default]
    Auto,
    Cpu,
    /// Require CUDA; construction fails when it is unavailable.
    Cuda,
}

impl FromStr for DevicePreference {
    type Err = VectorStoreError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(VectorStoreError::Config(format!(
                "Unsupported device '{other}' (expected 'auto', 'cpu' or 'cuda')"
            ))),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        })
    }
}

/// The device a store actually runs on after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda { device_id: i32 },
}

impl Device {
    #[must_use]
    pub const fn is_accelerated(&self) -> bool {
        matches!(self, Self::Cuda { .. })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

/// Picks the device for a preference, probing the CUDA execution provider when asked to.
pub fn resolve_device(preference: DevicePreference, cuda_device_id: i32) -> Result<Device> {
    if preference == DevicePreference::Cpu {
        return Ok(Device::Cpu);
    }

    if cuda_disabled_by_env() {
        return match preference {
            DevicePreference::Cuda => Err(VectorStoreError::ModelLoad(
                "CUDA was requested but is disabled via ORT_DISABLE_CUDA/ORT_USE_CUDA".to_string(),
            )),
            _ => {
                log::info!("CUDA disabled by environment, using CPU");
                Ok(Device::Cpu)
            }
        };
    }

    match probe_cuda(cuda_device_id) {
        Ok(()) => {
            log::info!("Using CUDA device {cuda_device_id}");
            Ok(Device::Cuda {
                device_id: cuda_device_id,
            })
        }
        Err(reason) if preference == DevicePreference::Auto => {
            log::info!("CUDA unavailable ({reason}), using CPU");
            Ok(Device::Cpu)
        }
        Err(reason) => Err(VectorStoreError::ModelLoad(format!(
            "CUDA execution provider is unavailable: {reason}"
        ))),
    }
}

fn probe_cuda(device_id: i32) -> std::result::Result<(), String> {
    let report = bootstrap_cuda_env_best_effort();
    let cuda = CUDAExecutionProvider::default().with_device_id(device_id);
    match cuda.is_available() {
        Ok(true) => Ok(()),
        Ok(false) => Err(format!(
            "provider not available (provider_present={} cublas_present={})",
            report.provider_present, report.cublas_present
        )),
        Err(err) => Err(format!(
            "provider check failed (provider_present={} cublas_present={}): {err}",
            report.provider_present, report.cublas_present
        )),
    }
}

pub fn cuda_disabled_by_env() -> bool {
    env::var("ORT_DISABLE_CUDA")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
        || env::var("ORT_USE_CUDA")
            .map(|v| v == "0" || v.eq_ignore_ascii_case("false"))
            .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize)]
pub struct GpuEnvReport {
    pub provider_present: bool,
    pub cublas_present: bool,
}

/// Points ORT at a CUDA provider library when one can be found.
///
/// Explicit user configuration (`ORT_LIB_LOCATION`, `ORT_STRATEGY`, ...) is never overridden.
pub fn bootstrap_cuda_env_best_effort() -> GpuEnvReport {
    if env::var_os("ORT_DISABLE_TENSORRT").is_none() {
        env::set_var("ORT_DISABLE_TENSORRT", "1");
    }
    if env::var_os("ORT_STRATEGY").is_none() {
        env::set_var("ORT_STRATEGY", "system");
    }

    let configured = env::var_os("ORT_LIB_LOCATION")
        .is_some_and(|dir| PathBuf::from(dir).join(ORT_PROVIDER_SO).exists());
    if !configured {
        if let Some(dir) = find_ort_provider_dir() {
            env::set_var("ORT_LIB_LOCATION", &dir);
            if env::var_os("ORT_DYLIB_PATH").is_none() {
                env::set_var("ORT_DYLIB_PATH", &dir);
            }
        }
    }

    let mut prepend: Vec<PathBuf> = Vec::new();
    if let Ok(dir) = env::var("ORT_LIB_LOCATION") {
        prepend.push(PathBuf::from(dir));
    }
    prepend.extend(cuda_toolkit_lib_dirs());
    prepend_ld_library_path(&prepend);

    diagnose_gpu_env()
}

pub fn diagnose_gpu_env() -> GpuEnvReport {
    let dirs = candidate_dirs();
    GpuEnvReport {
        provider_present: dirs.iter().any(|dir| dir.join(ORT_PROVIDER_SO).exists()),
        cublas_present: CUBLAS_CANDIDATES
            .iter()
            .any(|name| dirs.iter().any(|dir| dir.join(name).exists())),
    }
}

fn candidate_dirs() -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Ok(path) = env::var("ORT_LIB_LOCATION") {
        dirs.push(PathBuf::from(path));
    }
    if let Ok(ld) = env::var("LD_LIBRARY_PATH") {
        dirs.extend(ld.split(':').filter(|p| !p.is_empty()).map(PathBuf::from));
    }
    dirs.extend(ort_download_cache_dirs());
    dirs.extend(cuda_toolkit_lib_dirs());
    for dir in ["/lib/x86_64-linux-gnu", "/usr/lib/x86_64-linux-gnu"] {
        dirs.push(PathBuf::from(dir));
    }

    let mut seen = HashSet::new();
    dirs.into_iter()
        .filter(|dir| dir.exists() && seen.insert(dir.clone()))
        .collect()
}

fn find_ort_provider_dir() -> Option<PathBuf> {
    // Repo-local bundle first, then the ORT download cache.
    if let Ok(cwd) = env::current_dir() {
        for ancestor in cwd.ancestors() {
            let bundle = ancestor.join(".deps").join("ort_cuda");
            if bundle.join(ORT_PROVIDER_SO).exists() {
                return Some(bundle);
            }
        }
    }
    ort_download_cache_dirs().into_iter().next()
}

fn ort_download_cache_dirs() -> Vec<PathBuf> {
    let cache_root = env::var("XDG_CACHE_HOME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| env::var("HOME").ok().map(|home| Path::new(&home).join(".cache")));
    let Some(cache_root) = cache_root else {
        return Vec::new();
    };

    let dfbin = cache_root
        .join("ort.pyke.io")
        .join("dfbin")
        .join("x86_64-unknown-linux-gnu");
    let Ok(entries) = std::fs::read_dir(dfbin) else {
        return Vec::new();
    };

    entries
        .flatten()
        .map(|entry| entry.path().join("onnxruntime").join("lib"))
        .filter(|dir| dir.join(ORT_PROVIDER_SO).exists())
        .collect()
}

fn cuda_toolkit_lib_dirs() -> Vec<PathBuf> {
    [
        "/usr/local/cuda/lib64",
        "/usr/local/cuda/targets/x86_64-linux/lib",
    ]
    .iter()
    .map(PathBuf::from)
    .filter(|path| path.exists())
    .collect()
}

fn prepend_ld_library_path(paths: &[PathBuf]) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut ordered: Vec<String> = Vec::new();

    for path in paths.iter().filter(|p| p.exists()) {
        let value = path.to_string_lossy().into_owned();
        if seen.insert(value.clone()) {
            ordered.push(value);
        }
    }
    if ordered.is_empty() {
        return;
    }

    if let Ok(existing) = env::var("LD_LIBRARY_PATH") {
        for part in existing.split(':').filter(|p| !p.is_empty()) {
            if seen.insert(part.to_string()) {
                ordered.push(part.to_string());
            }
        }
    }
    env::set_var("LD_LIBRARY_PATH", ordered.join(":"));
}

#[cfg(test)]
mod tests {
    use super::*;

    static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

    struct EnvGuard {
        saved: Vec<(String, Option<std::ffi::OsString>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = Vec::new();
            for &key in keys {
                saved.push((key.to_string(), env::var_os(key)));
                env::remove_var(key);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(&key, v),
                    None => env::remove_var(&key),
                }
            }
        }
    }

    const ENV_KEYS: &[&str] = &[
        "HOME",
        "XDG_CACHE_HOME",
        "ORT_LIB_LOCATION",
        "ORT_DYLIB_PATH",
        "LD_LIBRARY_PATH",
        "ORT_DISABLE_TENSORRT",
        "ORT_STRATEGY",
        "ORT_USE_CUDA",
        "ORT_DISABLE_CUDA",
    ];

    #[test]
    fn preference_parses_case_insensitively() {
        assert_eq!("AUTO".parse::<DevicePreference>().unwrap(), DevicePreference::Auto);
        assert_eq!(" cpu ".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!("metal".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn cpu_preference_never_probes() {
        assert_eq!(resolve_device(DevicePreference::Cpu, 3).unwrap(), Device::Cpu);
    }

    #[test]
    fn disabled_cuda_falls_back_on_auto_and_fails_on_cuda() {
        let _lock = ENV_MUTEX.lock().expect("ENV_MUTEX");
        let _guard = EnvGuard::new(ENV_KEYS);
        env::set_var("ORT_DISABLE_CUDA", "1");

        assert_eq!(resolve_device(DevicePreference::Auto, 0).unwrap(), Device::Cpu);
        let err = resolve_device(DevicePreference::Cuda, 0).unwrap_err();
        assert!(matches!(err, VectorStoreError::ModelLoad(_)), "{err}");
    }

    #[test]
    fn bootstrap_uses_ort_cache_when_env_is_empty() {
        let _lock = ENV_MUTEX.lock().expect("ENV_MUTEX");
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = tempfile::tempdir().expect("tempdir");
        env::set_var("HOME", tmp.path());

        let lib_dir = tmp
            .path()
            .join(".cache/ort.pyke.io/dfbin/x86_64-unknown-linux-gnu/TEST/onnxruntime/lib");
        std::fs::create_dir_all(&lib_dir).expect("mkdir ort cache");
        std::fs::write(lib_dir.join(ORT_PROVIDER_SO), b"").expect("write provider stub");
        std::fs::write(lib_dir.join("libcublasLt.so.12"), b"").expect("write cublas stub");

        let report = bootstrap_cuda_env_best_effort();
        assert!(report.provider_present);
        assert!(report.cublas_present);
        assert_eq!(
            env::var("ORT_LIB_LOCATION").unwrap(),
            lib_dir.to_string_lossy()
        );
        assert!(env::var("LD_LIBRARY_PATH")
            .unwrap_or_default()
            .contains(lib_dir.to_string_lossy().as_ref()));
    }

    #[test]
    fn device_display_names_the_ordinal() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Cuda { device_id: 2 }.to_string(), "cuda:2");
        assert!(Device::Cuda { device_id: 0 }.is_accelerated());
    }
}
