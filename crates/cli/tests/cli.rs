use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const RECALL_ENV: &[&str] = &[
    "RECALL_EMBEDDING_MODEL",
    "EMBEDDING_MODEL_NAME",
    "RECALL_VECTOR_DIM",
    "VECTOR_DIM",
    "RECALL_INDEX_FILE",
    "FAISS_INDEX_FILE",
    "RECALL_METADATA_FILE",
    "METADATA_FILE",
    "RECALL_MODEL_DIR",
    "RECALL_CUDA_DEVICE",
];

#[allow(deprecated)]
fn recall(workdir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("recall").expect("binary");
    for key in RECALL_ENV {
        cmd.env_remove(key);
    }
    cmd.current_dir(workdir)
        .env("RECALL_EMBEDDING_MODE", "stub")
        .env("RECALL_DEVICE", "cpu");
    cmd
}

fn run_json(workdir: &Path, args: &[&str]) -> Value {
    let output = recall(workdir).args(args).output().expect("command run");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid json")
}

fn store(workdir: &Path, text: &str) -> String {
    run_json(workdir, &["store", text, "--json"])["id"]
        .as_str()
        .expect("id")
        .to_string()
}

#[test]
fn store_then_search_finds_the_exact_text() {
    let temp = tempdir().unwrap();
    let root = temp.path();

    let apples = store(root, "I like apples");
    let _cars = store(root, "The car is fast");
    assert!(root.join("faiss_index_file.index").exists());
    assert!(root.join("metadata.pkl").exists());

    let hits = run_json(root, &["search", "I like apples", "-n", "1", "--json"]);
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["id"], apples.as_str());
    assert!(hits[0]["distance"].as_f64().unwrap() < 1e-6);
}

#[test]
fn plain_store_prints_only_the_id() {
    let temp = tempdir().unwrap();
    recall(temp.path())
        .args(["store", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^[0-9a-f-]{36}\n$").unwrap());
}

#[test]
fn zero_and_negative_top_k_return_nothing() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    store(root, "one");

    for k in ["0", "-3"] {
        let hits = run_json(root, &["search", "one", "--top-k", k, "--json"]);
        assert_eq!(hits, Value::Array(Vec::new()), "top-k {k}");
    }
}

#[test]
fn search_on_a_fresh_directory_is_empty() {
    let temp = tempdir().unwrap();
    let hits = run_json(temp.path(), &["search", "anything", "--json"]);
    assert_eq!(hits, Value::Array(Vec::new()));
}

#[test]
fn fields_and_paths_flow_through_flags() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    let paths = [
        "--index-file",
        "data/custom.index",
        "--metadata-file",
        "data/custom.json",
    ];

    let mut args = vec!["store", "handbook text", "--field", "page=12", "--json"];
    args.extend(paths);
    run_json(root, &args);

    let metadata: Value =
        serde_json::from_slice(&fs::read(root.join("data/custom.json")).unwrap()).unwrap();
    assert_eq!(metadata["schema_version"], 1);
    assert_eq!(metadata["entries"]["0"]["page"], 12);

    let mut args = vec!["stats", "--json"];
    args.extend(paths);
    let stats = run_json(root, &args);
    assert_eq!(stats["vectors"], 1);
    assert_eq!(stats["metadata_entries"], 1);
    assert_eq!(stats["device"]["kind"], "cpu");
    assert_eq!(stats["accelerated"], false);
}

#[test]
fn dotenv_file_configures_the_store() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    fs::write(
        root.join(".env"),
        "RECALL_VECTOR_DIM=16\nRECALL_INDEX_FILE=from-env.index\n",
    )
    .unwrap();

    store(root, "configured by dotenv");
    assert!(root.join("from-env.index").exists());
    let stats = run_json(root, &["stats", "--json"]);
    assert_eq!(stats["dimension"], 16);
}

#[test]
fn reopening_with_another_dimension_fails() {
    let temp = tempdir().unwrap();
    let root = temp.path();
    store(root, "first");

    recall(root)
        .args(["--dimension", "16", "stats"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("dimension"));
}

#[test]
fn doctor_in_stub_mode_is_ok() {
    let temp = tempdir().unwrap();
    let report = run_json(
        temp.path(),
        &["doctor", "--json", "--model-dir", temp.path().to_str().unwrap()],
    );
    assert_eq!(report["ok"], true);
    assert_eq!(report["embedding_mode"], "stub");
    assert_eq!(report["manifest_present"], false);
}
