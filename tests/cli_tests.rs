use aggspill::EngineConfig;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Helper to write one JSON document per line
fn create_input(dir: &Path, count: usize) -> Result<PathBuf> {
    let path = dir.join("docs.jsonl");
    let big_str = ",".repeat(1024);
    let mut content = String::new();
    for i in 0..count {
        let document = serde_json::json!({
            "_id": i,
            "bigStr": format!("{}{}", i, big_str),
            "random": ((i * 7919 + 13) % 997) as f64 / 997.0,
        });
        content.push_str(&document.to_string());
        content.push('\n');
    }
    fs::write(&path, content)?;
    Ok(path)
}

fn create_config(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("config.json");
    let config = EngineConfig {
        memory_limit_bytes: 100 * 1024,
        temp_directory: dir.join("spill"),
        ..EngineConfig::default()
    };
    config.to_file(&path)?;
    Ok(path)
}

fn run_cli(dir: &Path, pipeline: &str, extra: &[&str]) -> Result<Output> {
    let pipeline_path = dir.join("pipeline.json");
    fs::write(&pipeline_path, pipeline)?;

    let output = Command::new(env!("CARGO_BIN_EXE_aggspill"))
        .arg("--input")
        .arg(dir.join("docs.jsonl"))
        .arg("--pipeline")
        .arg(&pipeline_path)
        .arg("--config")
        .arg(dir.join("config.json"))
        .arg("--output")
        .arg(dir.join("out").join("results.jsonl"))
        .args(extra)
        .output()?;
    Ok(output)
}

#[test]
fn test_cli_sort_with_disk_use() -> Result<()> {
    let temp_dir = TempDir::new()?;
    create_input(temp_dir.path(), 101)?;
    create_config(temp_dir.path())?;

    let output = run_cli(temp_dir.path(), r#"[{"$sort": {"random": 1}}]"#, &["--allow-disk-use"])?;
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let results = fs::read_to_string(temp_dir.path().join("out").join("results.jsonl"))?;
    let randoms: Vec<f64> = results
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["random"].as_f64().unwrap())
        .collect();
    assert_eq!(randoms.len(), 101);
    assert!(randoms.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[test]
fn test_cli_failure_writes_no_output() -> Result<()> {
    let temp_dir = TempDir::new()?;
    create_input(temp_dir.path(), 101)?;
    create_config(temp_dir.path())?;

    let output = run_cli(
        temp_dir.path(),
        r#"[{"$group": {"_id": "$_id", "bigStr": {"$min": "$bigStr"}}}]"#,
        &[],
    )?;
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("16945"));
    assert!(!temp_dir.path().join("out").join("results.jsonl").exists());
    Ok(())
}

#[test]
fn test_cli_request_object_rejects_numeric_flag() -> Result<()> {
    let temp_dir = TempDir::new()?;
    create_input(temp_dir.path(), 3)?;
    create_config(temp_dir.path())?;

    let output = run_cli(
        temp_dir.path(),
        r#"{"pipeline": [{"$limit": 2}], "allowDiskUse": 1}"#,
        &[],
    )?;
    assert!(!output.status.success());

    let output = run_cli(
        temp_dir.path(),
        r#"{"pipeline": [{"$limit": 2}], "allowDiskUse": false}"#,
        &[],
    )?;
    assert!(output.status.success());
    let results = fs::read_to_string(temp_dir.path().join("out").join("results.jsonl"))?;
    assert_eq!(results.lines().count(), 2);
    Ok(())
}

#[test]
fn test_cli_creates_default_config() -> Result<()> {
    let temp_dir = TempDir::new()?;
    create_input(temp_dir.path(), 3)?;

    let output = run_cli(temp_dir.path(), r#"[{"$sort": {"_id": -1}}]"#, &[])?;
    assert!(output.status.success());
    assert!(temp_dir.path().join("config.json").exists());

    let config = EngineConfig::from_file(&temp_dir.path().join("config.json"))?;
    assert_eq!(config.memory_limit_bytes, 100 * 1024 * 1024);
    Ok(())
}

#[test]
fn test_cli_stdout_stays_empty_when_merge_fails() -> Result<()> {
    let temp_dir = TempDir::new()?;
    create_config(temp_dir.path())?;

    // Group 0 is emitted first; group 1 then outgrows the ceiling while its
    // runs are merged
    let big_str = ",".repeat(1024);
    let mut content = String::new();
    for i in 0..101 {
        let document = serde_json::json!({
            "_id": i,
            "k": if i == 0 { 0 } else { 1 },
            "bigStr": format!("{}{}", i, big_str),
        });
        content.push_str(&document.to_string());
        content.push('\n');
    }
    fs::write(temp_dir.path().join("docs.jsonl"), content)?;

    let pipeline_path = temp_dir.path().join("pipeline.json");
    fs::write(&pipeline_path, r#"[{"$group": {"_id": "$k", "all": {"$push": "$bigStr"}}}]"#)?;

    let output = Command::new(env!("CARGO_BIN_EXE_aggspill"))
        .arg("--input")
        .arg(temp_dir.path().join("docs.jsonl"))
        .arg("--pipeline")
        .arg(&pipeline_path)
        .arg("--config")
        .arg(temp_dir.path().join("config.json"))
        .arg("--allow-disk-use")
        .output()?;

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("16945"));
    assert!(output.stdout.is_empty(), "{}", String::from_utf8_lossy(&output.stdout));
    Ok(())
}

#[test]
fn test_cli_writes_stdout_on_success() -> Result<()> {
    let temp_dir = TempDir::new()?;
    create_input(temp_dir.path(), 5)?;
    create_config(temp_dir.path())?;

    let pipeline_path = temp_dir.path().join("pipeline.json");
    fs::write(&pipeline_path, r#"[{"$sort": {"_id": -1}}, {"$limit": 3}]"#)?;

    let output = Command::new(env!("CARGO_BIN_EXE_aggspill"))
        .arg("--input")
        .arg(temp_dir.path().join("docs.jsonl"))
        .arg("--pipeline")
        .arg(&pipeline_path)
        .arg("--config")
        .arg(temp_dir.path().join("config.json"))
        .output()?;

    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let ids: Vec<i64> = String::from_utf8(output.stdout)?
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![4, 3, 2]);
    Ok(())
}
