use recall_vector_store::{
    cuda_disabled_by_env, diagnose_gpu_env, load_manifest, model_dir, normalize_model_id,
    resolve_device, resolve_model_spec, Device, EmbeddingMode, GpuEnvReport, StoreConfig,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub model_dir: String,
    pub embedding_mode: String,
    pub embedding_model: String,
    pub device_preference: String,
    pub device: Option<Device>,
    pub device_error: Option<String>,
    pub cuda_disabled: bool,
    pub gpu: GpuEnvReport,
    pub manifest_present: bool,
    pub manifest_error: Option<String>,
    pub model: Option<ModelDoctorItem>,
    pub model_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelDoctorItem {
    pub id: String,
    pub ok: bool,
    pub missing_assets: Vec<String>,
    pub bad_sha256: Vec<BadSha>,
}

#[derive(Debug, Serialize)]
pub struct BadSha {
    pub path: String,
    pub expected: String,
    pub actual: String,
}

/// Checks what `VectorStore::open` would need, without opening any store files.
pub fn doctor(config: &StoreConfig) -> DoctorReport {
    let dir = config.model_dir.clone().unwrap_or_else(model_dir);
    let stub = config.embedding_mode == EmbeddingMode::Stub;
    let mut report = DoctorReport {
        ok: false,
        model_dir: dir.display().to_string(),
        embedding_mode: config.embedding_mode.to_string(),
        embedding_model: normalize_model_id(&config.model_id),
        device_preference: config.device.to_string(),
        device: None,
        device_error: None,
        cuda_disabled: cuda_disabled_by_env(),
        gpu: diagnose_gpu_env(),
        manifest_present: false,
        manifest_error: None,
        model: None,
        model_error: None,
    };

    if stub {
        report.device = Some(Device::Cpu);
    } else {
        match resolve_device(config.device, config.cuda_device_id) {
            Ok(device) => report.device = Some(device),
            Err(err) => report.device_error = Some(err.to_string()),
        }
    }

    let assets: Vec<(String, String)> = match load_manifest(&dir) {
        Ok(Some(manifest)) => {
            report.manifest_present = true;
            manifest
                .models
                .iter()
                .find(|m| normalize_model_id(&m.id) == report.embedding_model)
                .map(|m| {
                    m.assets
                        .iter()
                        .map(|a| (a.path.clone(), a.sha256.clone()))
                        .collect()
                })
                .unwrap_or_default()
        }
        Ok(None) => Vec::new(),
        Err(err) => {
            report.manifest_error = Some(err.to_string());
            Vec::new()
        }
    };

    if report.manifest_error.is_none() {
        match resolve_model_spec(&dir, &config.model_id) {
            Ok(spec) => {
                let mut item = ModelDoctorItem {
                    id: spec.id.clone(),
                    ok: true,
                    missing_assets: Vec::new(),
                    bad_sha256: Vec::new(),
                };
                if assets.is_empty() {
                    for path in [spec.model_path(&dir), spec.tokenizer_path(&dir)] {
                        if !path.exists() {
                            item.missing_assets.push(path.display().to_string());
                        }
                    }
                } else {
                    check_assets(&dir, &assets, &mut item);
                }
                item.ok = item.missing_assets.is_empty() && item.bad_sha256.is_empty();
                report.model = Some(item);
            }
            Err(err) => report.model_error = Some(err.to_string()),
        }
    }

    let model_ok = report.model.as_ref().is_some_and(|m| m.ok);
    report.ok = stub || (model_ok && report.device.is_some());
    report
}

fn check_assets(dir: &Path, assets: &[(String, String)], item: &mut ModelDoctorItem) {
    for (rel, sha256) in assets {
        let Some(local) = safe_join(dir, rel) else {
            item.missing_assets.push(format!("invalid_path: {rel}"));
            continue;
        };
        if !local.exists() {
            item.missing_assets.push(rel.clone());
            continue;
        }

        let expected = sha256.trim().to_ascii_lowercase();
        if expected.is_empty() {
            continue;
        }
        match sha256_file(&local) {
            Ok(actual) if actual != expected => item.bad_sha256.push(BadSha {
                path: rel.clone(),
                expected,
                actual,
            }),
            Ok(_) => {}
            Err(err) => item.missing_assets.push(format!("unreadable: {rel} ({err})")),
        }
    }
}

fn safe_join(dir: &Path, rel: &str) -> Option<PathBuf> {
    let path = Path::new(rel);
    let relative = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    (relative && path.components().any(|c| matches!(c, Component::Normal(_))))
        .then(|| dir.join(path))
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

pub fn print_report(report: &DoctorReport) {
    eprintln!("Model dir: {}", report.model_dir);
    eprintln!(
        "Embedding mode/model: {} / {}",
        report.embedding_mode, report.embedding_model
    );
    match (&report.device, &report.device_error) {
        (Some(device), _) => eprintln!("Device: {device} (requested {})", report.device_preference),
        (None, Some(err)) => eprintln!("Device: error ({err})"),
        (None, None) => eprintln!("Device: unknown"),
    }
    if report.cuda_disabled {
        eprintln!("CUDA: disabled by environment");
    }
    eprintln!(
        "GPU runtime: provider {}, cuBLAS {}",
        found(report.gpu.provider_present),
        found(report.gpu.cublas_present)
    );
    if let Some(err) = &report.manifest_error {
        eprintln!("Manifest: error ({err})");
    } else if report.manifest_present {
        eprintln!("Manifest: ok");
    } else {
        eprintln!("Manifest: not found (using built-in model layout)");
    }
    if let Some(err) = &report.model_error {
        eprintln!("Model: error ({err})");
    }
    if let Some(model) = &report.model {
        if model.ok {
            eprintln!("Model '{}': ok", model.id);
        } else {
            eprintln!("Model '{}' issues:", model.id);
            for miss in &model.missing_assets {
                eprintln!("  - missing: {miss}");
            }
            for bad in &model.bad_sha256 {
                eprintln!(
                    "  - sha256 mismatch: {} (expected {}, got {})",
                    bad.path, bad.expected, bad.actual
                );
            }
        }
    }
    eprintln!("Overall: {}", if report.ok { "ok" } else { "not ready" });
}

const fn found(present: bool) -> &'static str {
    if present {
        "found"
    } else {
        "missing"
    }
}
