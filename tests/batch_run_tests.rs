#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use serde_json::Value;
use tempfile::TempDir;

const BIN: &str = env!("CARGO_BIN_EXE_batch-scheduler");

struct Fixture {
    _dir: TempDir,
    input: PathBuf,
    output: PathBuf,
    config: PathBuf,
    root: PathBuf,
}

/// 创建输入文件、伪造的 nvidia-smi 与配置文件
fn fixture(gpus: u32, files: &[(&str, usize)], command: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = fs::canonicalize(dir.path()).unwrap();
    let input = root.join("input");
    fs::create_dir_all(&input).unwrap();
    for (name, size) in files {
        fs::write(input.join(name), vec![0u8; *size]).unwrap();
    }

    let smi = root.join("fake-nvidia-smi");
    let mut script = String::from("#!/bin/sh\n");
    if gpus == 0 {
        script.push_str("exit 1\n");
    } else {
        for index in 0..gpus {
            script.push_str(&format!("echo '{index}, Fake GPU {index}, 8192, 8.6'\n"));
        }
    }
    fs::write(&smi, script).unwrap();
    fs::set_permissions(&smi, fs::Permissions::from_mode(0o755)).unwrap();

    let config = root.join("batch.toml");
    fs::write(
        &config,
        format!(
            r#"[scheduler]
nvidia_smi_program = "{}"
grace_period_seconds = 2

[retry]
max_attempts = 2
initial_delay_ms = 10
max_delay_ms = 100

[processor]
shell_command = '''{command}'''

[logging]
level = "debug"
"#,
            smi.display()
        ),
    )
    .unwrap();

    Fixture {
        output: root.join("output"),
        input,
        config,
        root,
        _dir: dir,
    }
}

fn run(fixture: &Fixture, extra: &[&str]) -> Output {
    Command::new(BIN)
        .arg("--config")
        .arg(&fixture.config)
        .arg("run")
        .arg(&fixture.input)
        .arg("--output")
        .arg(&fixture.output)
        .args(extra)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn manifest(fixture: &Fixture) -> Value {
    let text = fs::read_to_string(fixture.output.join("batch_manifest.json")).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn statuses(manifest: &Value) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = manifest["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| {
            let path = Path::new(e["input_path"].as_str().unwrap());
            (
                path.file_name().unwrap().to_string_lossy().into_owned(),
                e["status"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    entries.sort();
    entries
}

#[test]
fn test_all_files_succeed_across_devices() {
    let fixture = fixture(
        2,
        &[("a.wav", 400), ("b.wav", 300), ("c.wav", 200), ("d.wav", 100), ("notes.txt", 10)],
        r#"cp {input} {output_dir}/ && echo '{"audio_duration_seconds": 2.0}'"#,
    );

    let output = run(&fixture, &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "stdout: {stdout}");
    assert!(stdout.contains("=== Summary ==="));
    assert!(stdout.contains("Successful: 4"));
    assert!(stdout.contains("RTF"));
    assert!(!stdout.contains("notes.txt"));

    for name in ["a", "b", "c", "d"] {
        assert!(fixture.output.join(name).join(format!("{name}.wav")).exists());
    }

    let manifest = manifest(&fixture);
    assert_eq!(
        statuses(&manifest),
        vec![
            ("a.wav".to_string(), "succeeded".to_string()),
            ("b.wav".to_string(), "succeeded".to_string()),
            ("c.wav".to_string(), "succeeded".to_string()),
            ("d.wav".to_string(), "succeeded".to_string()),
        ]
    );
    // 按大小降序轮询分配: a,c → 0; b,d → 1
    let devices: Vec<(String, String)> = manifest["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| {
            (
                e["input_path"].as_str().unwrap().rsplit('/').next().unwrap().to_string(),
                e["assigned_device"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert!(devices.contains(&("a.wav".to_string(), "0".to_string())));
    assert!(devices.contains(&("b.wav".to_string(), "1".to_string())));
    assert!(devices.contains(&("c.wav".to_string(), "0".to_string())));
    assert!(devices.contains(&("d.wav".to_string(), "1".to_string())));
}

#[test]
fn test_partial_failure_exits_with_one() {
    let fixture = fixture(
        2,
        &[("good.wav", 200), ("bad.wav", 100)],
        r#"case {input} in *bad.wav) echo "decode error" >&2; exit 3;; esac"#,
    );

    let output = run(&fixture, &[]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(1), "stdout: {stdout}");
    assert!(stdout.contains("Successful: 1"));
    assert!(stdout.contains("=== Failed Files ==="));
    assert!(stdout.contains("bad.wav"));
    assert!(stdout.contains("decode error"));

    assert_eq!(
        statuses(&manifest(&fixture)),
        vec![
            ("bad.wav".to_string(), "failed".to_string()),
            ("good.wav".to_string(), "succeeded".to_string()),
        ]
    );
}

#[test]
fn test_resume_only_processes_unfinished_files() {
    let fixture = fixture(
        1,
        &[("one.wav", 300), ("two.wav", 200), ("three.wav", 100)],
        r#"case {input} in *two.wav) exit 4;; esac"#,
    );
    assert_eq!(run(&fixture, &[]).status.code(), Some(1));

    let log = fixture.root.join("processed.log");
    let command = format!("echo {{input}} >> '{}'", log.display());
    let output = run(&fixture, &["--command", &command]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(0), "stdout: {stdout}");

    let processed = fs::read_to_string(&log).unwrap();
    let processed: Vec<&str> = processed.lines().collect();
    assert_eq!(processed.len(), 1);
    assert!(processed[0].ends_with("two.wav"));

    assert!(statuses(&manifest(&fixture))
        .iter()
        .all(|(_, status)| status == "succeeded"));
}

#[test]
fn test_transient_failures_are_retried() {
    let fixture = fixture(1, &[("flaky.wav", 100)], "test \"$BATCH_ATTEMPT\" -ge 2 || exit 75");

    let output = run(&fixture, &[]);
    assert_eq!(output.status.code(), Some(0));

    let manifest = manifest(&fixture);
    assert_eq!(manifest["entries"][0]["status"], "succeeded");
    assert_eq!(manifest["entries"][0]["attempts"], 2);
}

#[test]
fn test_timeout_cancels_running_and_queued_tasks() {
    let fixture = fixture(1, &[("slow.wav", 200), ("queued.wav", 100)], "exec sleep 30");

    let started = Instant::now();
    let output = run(&fixture, &["--timeout", "1"]);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(output.status.code(), Some(1));

    assert_eq!(
        statuses(&manifest(&fixture)),
        vec![
            ("queued.wav".to_string(), "failed".to_string()),
            ("slow.wav".to_string(), "failed".to_string()),
        ]
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("=== Failed Files ==="));
}

#[test]
fn test_invalid_device_exits_with_two_before_spawning() {
    let fixture = fixture(2, &[("a.wav", 100)], "true");

    let output = run(&fixture, &["--devices", "0,5"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("设备不可用"));
    assert!(!fixture.output.exists());
}

#[test]
fn test_empty_input_exits_with_two() {
    let fixture = fixture(1, &[("readme.txt", 10)], "true");

    let output = run(&fixture, &[]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("未找到匹配文件"));
}

#[test]
fn test_cpu_fallback_without_accelerators() {
    let fixture = fixture(0, &[("a.wav", 100)], "test -z \"$CUDA_VISIBLE_DEVICES\"");

    let output = run(&fixture, &[]);
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(manifest(&fixture)["entries"][0]["assigned_device"], "cpu");
}

#[test]
fn test_devices_and_estimate_commands() {
    let fixture = fixture(2, &[("a.wav", 300), ("b.wav", 100)], "true");

    let output = Command::new(BIN)
        .arg("--config")
        .arg(&fixture.config)
        .args(["devices", "--json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let devices: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(devices["count"], 2);
    assert_eq!(devices["accelerator_available"], true);
    assert_eq!(devices["details"][1]["name"], "Fake GPU 1");

    let output = Command::new(BIN)
        .arg("--config")
        .arg(&fixture.config)
        .arg("estimate")
        .arg(&fixture.input)
        .arg("--json")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let info: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["estimate"]["count"], 2);
    assert_eq!(info["estimate"]["total_bytes"], 400);
    assert_eq!(info["distribution"]["files_per_device"]["0"], 1);
}
