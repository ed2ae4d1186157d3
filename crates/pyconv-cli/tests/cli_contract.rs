#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const MAGIC_311: &[u8] = b"\xa7\r\r\n\x00\x00\x00\x00\x04\x94\x90d\xd4`\x00\x00";

fn pyconv() -> Command {
    let mut cmd = Command::cargo_bin("pyconv").expect("pyconv binary");
    cmd.env_remove("PYCONV_CONFIG")
        .env_remove("PYCONV_INTERPRETER")
        .env_remove("PYCONV_TIMEOUT")
        .env_remove("PYCONV_HOST_VERSION");
    cmd
}

fn have_python() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn write(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn version_prints_package_version() {
    pyconv()
        .arg("version")
        .assert()
        .success()
        .stdout(format!("{}\n", env!("CARGO_PKG_VERSION")));
}

#[test]
fn detect_classifies_by_header() {
    let dir = tempdir().unwrap();
    let container = write(dir.path(), "a.pyc", MAGIC_311);
    let payload = write(dir.path(), "b.py", b"\xe3\x00\x00\x00");
    let short = write(dir.path(), "c.bin", b"\x00\r\r");

    pyconv()
        .arg("detect")
        .args([&container, &payload, &short])
        .assert()
        .success()
        .stdout(predicate::str::contains("a.pyc: container"))
        .stdout(predicate::str::contains("b.py: payload"))
        .stdout(predicate::str::contains("c.bin: payload"));
}

#[test]
fn detect_missing_file_fails() {
    pyconv()
        .args(["detect", "/nonexistent/x.pyc"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("error:"));
}

#[test]
fn magic_lists_table_with_default() {
    pyconv()
        .arg("magic")
        .assert()
        .success()
        .stdout(predicate::str::contains("a70d0d0a0000000004949064d4600000 (default)"))
        .stdout(predicate::str::contains("3.6"))
        .stdout(predicate::str::contains("3.13"));
}

#[test]
fn magic_unknown_version_falls_back() {
    let output = pyconv()
        .args(["magic", "--version", "2.7", "--format", "json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v: Value = serde_json::from_slice(&output).expect("json");
    assert_eq!(v["requested"], "2.7");
    assert_eq!(v["version"], "3.11");
    assert_eq!(v["fallback"], true);
    assert_eq!(v["magic"], "a70d0d0a0000000004949064d4600000");
}

#[test]
fn magic_overrides_come_from_config() {
    let dir = tempdir().unwrap();
    let config = write(
        dir.path(),
        "pyconv.yaml",
        b"magic:\n  overrides:\n    \"3.14\": \"2b0e0d0a000000000000000000000000\"\n",
    );

    pyconv()
        .arg("--config")
        .arg(&config)
        .args(["magic", "--version", "3.14"])
        .assert()
        .success()
        .stdout("3.14 2b0e0d0a000000000000000000000000\n");
}

#[test]
fn invalid_config_exits_2() {
    let dir = tempdir().unwrap();
    let config = write(
        dir.path(),
        "pyconv.yaml",
        b"magic:\n  overrides:\n    \"3.14\": \"a70d\"\n",
    );

    pyconv()
        .arg("magic")
        .env("PYCONV_CONFIG", &config)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("must be 16 bytes"));
}

#[test]
fn oversized_input_is_rejected_before_conversion() {
    let dir = tempdir().unwrap();
    let config = write(dir.path(), "pyconv.yaml", b"max_input_bytes: 8\n");
    let big = write(dir.path(), "big.pyc", &[MAGIC_311, b"more bytes"].concat());

    pyconv()
        .arg("--config")
        .arg(&config)
        .args(["--host-version", "3.11", "--interpreter", "/nonexistent/python3"])
        .arg("convert")
        .arg(&big)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("file too large (26 bytes, limit 8)"));
    assert!(!dir.path().join("big_marshal.py").exists());
}

#[test]
fn unusable_interpreter_fails_each_conversion() {
    let dir = tempdir().unwrap();
    let payload = write(dir.path(), "blob.bin", b"\xe3\x00\x00\x00");

    pyconv()
        .args(["--host-version", "3.11", "--interpreter", "/nonexistent/python3"])
        .arg("convert")
        .arg(&payload)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("blob.bin: conversion failed"));
}

#[test]
fn unidentifiable_host_exits_2() {
    let dir = tempdir().unwrap();
    let payload = write(dir.path(), "blob.bin", b"\xe3\x00\x00\x00");

    pyconv()
        .env("PYCONV_INTERPRETER", "/nonexistent/python3")
        .arg("convert")
        .arg(&payload)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("failed to set up converter"));
}

#[test]
fn convert_round_trip_writes_outputs() {
    if !have_python() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    let payload = std::process::Command::new("python3")
        .args([
            "-c",
            "import marshal, sys; sys.stdout.buffer.write(marshal.dumps(compile('x = 1', 'm.py', 'exec')))",
        ])
        .output()
        .unwrap()
        .stdout;
    let input = write(dir.path(), "mod.bin", &payload);

    pyconv()
        .arg("convert")
        .arg(&input)
        .arg("--out-dir")
        .arg(&out)
        .assert()
        .success()
        .stdout(predicate::str::contains("Marshal -> PYC"));

    let pyc = fs::read(out.join("mod.pyc")).unwrap();
    assert_eq!(pyc.len(), 16 + payload.len());
    assert_eq!(&pyc[16..], payload.as_slice());

    pyconv()
        .arg("convert")
        .arg(out.join("mod.pyc"))
        .assert()
        .success()
        .stdout(predicate::str::contains("PYC -> Marshal"));

    let loader = fs::read_to_string(out.join("mod_marshal.py")).unwrap();
    assert!(loader.starts_with(
        "# Marshal/PYC converter\n# File name: [mod.pyc] (PYC -> Marshal)\n\n"
    ));
}

#[test]
fn info_reports_pinned_version() {
    pyconv()
        .args(["--host-version", "3.12", "info", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"host_version\": \"3.12\""))
        .stdout(predicate::str::contains("\"magic_version\": \"3.12\""))
        .stdout(predicate::str::contains("\"timeout_secs\": 15"));
}
