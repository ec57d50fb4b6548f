use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("vllm-soak");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn write_config(path: &Path, body: &str) {
    fs::write(path, format!("version: 1\n{body}")).unwrap();
}

#[test]
fn config_init_creates_and_preserves_existing() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("conf").join("soak.yaml");

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    assert!(value["result"]["created"].as_bool().unwrap());
    assert!(config_path.exists());

    fs::write(&config_path, "sentinel: true\n").unwrap();

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("init")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    assert!(!value["result"]["created"].as_bool().unwrap());
    assert_eq!(fs::read_to_string(&config_path).unwrap(), "sentinel: true\n");
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("soak.yaml");
    write_config(&config_path, "model:\n  path: /models/a\n  name: a\n  shard: 2\n");

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    assert!(value["error"].as_str().unwrap().contains("unknown field"));
}

#[test]
fn config_validate_requires_model_fields() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("soak.yaml");
    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("init")
        .assert()
        .success();

    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .failure()
        .stderr(contains("model.path must be non-empty"));
}

#[test]
fn config_validate_accepts_complete_file() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("soak.yaml");
    write_config(
        &config_path,
        "model:\n  path: /models/llama\n  name: llama\nschedule:\n  iterations: 2\n",
    );

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("config")
        .arg("validate")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["result"]["valid"].as_bool().unwrap());
}

#[test]
fn run_without_model_path_is_a_config_error() {
    bin()
        .arg("run")
        .arg("--model-name")
        .arg("llama")
        .assert()
        .failure()
        .code(1)
        .stderr(contains("model.path must be non-empty"));
}

#[test]
fn run_rejects_zero_iterations() {
    bin()
        .arg("run")
        .arg("--model-path")
        .arg("/models/llama")
        .arg("--model-name")
        .arg("llama")
        .arg("--test-iterations")
        .arg("0")
        .arg("--dry-run")
        .assert()
        .failure()
        .stderr(contains("schedule.iterations must be greater than 0"));
}

#[test]
fn dry_run_prints_launch_command() {
    bin()
        .arg("run")
        .arg("--model-path")
        .arg("/srv/models/Llama-3-8B")
        .arg("--model-name")
        .arg("llama3")
        .arg("--port")
        .arg("8100")
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(contains("docker run -d --network=host"))
        .stdout(contains("-v /srv/models:/app/models:ro"))
        .stdout(contains("-p 8100:8100"))
        .stdout(contains("--model /app/models/Llama-3-8B"))
        .stdout(contains("--served-model-name llama3"))
        .stdout(contains("--enable-prefix-caching"));
}

#[test]
fn dry_run_merges_config_file_and_flags() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("soak.yaml");
    write_config(
        &config_path,
        "model:\n  path: /models/a\n  name: a\nserver:\n  image: rocm/vllm:custom\n  max_num_seqs: 64\ndocker:\n  binary: podman\n",
    );

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .arg("--model-name")
        .arg("b")
        .arg("--dry-run")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    let command = value["result"]["command"].as_str().unwrap();
    assert!(command.starts_with("podman run"));
    assert!(command.contains("rocm/vllm:custom"));
    assert!(command.contains("--served-model-name b"));
    assert!(command.contains("--max-num-seqs 64"));
    let args = value["result"]["args"].as_array().unwrap();
    assert_eq!(args[0], "run");
}

#[test]
fn run_fails_when_runtime_binary_is_missing() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("soak.yaml");
    write_config(
        &config_path,
        "model:\n  path: /models/a\n  name: a\ndocker:\n  binary: definitely-not-a-container-runtime\n",
    );

    bin()
        .arg("--config")
        .arg(&config_path)
        .arg("run")
        .arg("--log-dir")
        .arg(dir.path().join("logs"))
        .assert()
        .failure()
        .stderr(contains("not found on PATH"));
    assert!(!dir.path().join("logs").exists());
}
