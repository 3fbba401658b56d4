//! CLI tests for `case-inspect`.
//!
//! Each test records a dry-run case with scripted workers, then spawns the
//! binary against it and checks exit codes and output.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use codemod_runner::core::types::{ArgumentRecord, EngineHint};
use codemod_runner::exit_codes;
use codemod_runner::io::config::RunConfig;
use codemod_runner::io::report::Reporter;
use codemod_runner::run::{RunRequest, run_codemod};
use codemod_runner::test_support::{
    RecordingApplier, Script, ScriptedFactory, TestTree, thread_spawner,
};

fn record_dry_run(tree: &TestTree) -> PathBuf {
    let mut config = RunConfig::default();
    config.pool_size = 2;
    config.tick_interval_ms = 25;
    let request = RunRequest {
        target: tree.root().to_path_buf(),
        engine: EngineHint::Template,
        codemod_source: b"upper-a".to_vec(),
        arguments: ArgumentRecord::new(),
        config,
        dry_run: true,
    };
    let factory = ScriptedFactory::new().on("a.txt", Script::Change("A"));
    let summary = run_codemod(
        request,
        thread_spawner(factory),
        &mut RecordingApplier::default(),
        &mut Reporter::new(Vec::new()),
    )
    .expect("dry run");
    summary.case_path
}

fn inspect(args: &[&OsStr]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_case-inspect"))
        .args(args)
        .output()
        .expect("case-inspect")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn verify_accepts_an_intact_case() {
    let tree = TestTree::new(&[("a.txt", "a"), ("b.txt", "b")]);
    let case_path = record_dry_run(&tree);

    let output = inspect(&[OsStr::new("verify"), case_path.as_os_str()]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(stdout(&output).starts_with("verify: ok jobs=1 "));
}

#[test]
fn verify_rejects_a_tampered_trailer() {
    let tree = TestTree::new(&[("a.txt", "a")]);
    let case_path = record_dry_run(&tree);
    let mut bytes = fs::read(&case_path).expect("read case");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&case_path, bytes).expect("write case");

    let output = inspect(&[OsStr::new("verify"), case_path.as_os_str()]);

    assert_eq!(output.status.code(), Some(exit_codes::CORRUPT));
    assert!(stdout(&output).contains("trailer digest mismatch"));
}

#[test]
fn show_accepts_the_case_directory() {
    let tree = TestTree::new(&[("a.txt", "a"), ("b.txt", "b")]);
    let case_path = record_dry_run(&tree);
    let case_dir = case_path.parent().expect("case dir");

    let output = inspect(&[OsStr::new("show"), case_dir.as_os_str()]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let json: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(json["verified"], true);
    assert_eq!(json["jobs"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["jobs"][0]["kind"], "rewrite_file");
    let target = tree.root().canonicalize().unwrap();
    assert_eq!(
        json["case"]["absolute_target_path"],
        target.display().to_string()
    );
}

#[test]
fn replay_materialises_a_dry_run_elsewhere() {
    let tree = TestTree::new(&[("a.txt", "a"), ("nested/b.txt", "b")]);
    let case_path = record_dry_run(&tree);
    let out = tempfile::tempdir().expect("out");
    let into = out.path().join("replayed");

    let output = inspect(&[
        OsStr::new("replay"),
        case_path.as_os_str(),
        OsStr::new("--into"),
        into.as_os_str(),
        OsStr::new("--seed"),
    ]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(stdout(&output).contains("replay: applied=1 failed=0"));
    assert_eq!(read(&into, "a.txt"), "A");
    assert_eq!(read(&into, "nested/b.txt"), "b");
    assert!(!into.join(".codemod").exists());
    assert_eq!(tree.read("a.txt"), "a");
}

#[test]
fn replay_refuses_an_unverified_case() {
    let tree = TestTree::new(&[("a.txt", "a")]);
    let case_path = record_dry_run(&tree);
    let bytes = fs::read(&case_path).expect("read case");
    fs::write(&case_path, &bytes[..bytes.len() - 24]).expect("truncate");
    let out = tempfile::tempdir().expect("out");

    let output = inspect(&[
        OsStr::new("replay"),
        case_path.as_os_str(),
        OsStr::new("--into"),
        out.path().as_os_str(),
    ]);

    assert_eq!(output.status.code(), Some(exit_codes::CORRUPT));
    assert!(!out.path().join("a.txt").exists());
}

#[test]
fn missing_case_file_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let missing = temp.path().join("nope.bin");

    let output = inspect(&[OsStr::new("verify"), missing.as_os_str()]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

fn read(root: &Path, name: &str) -> String {
    fs::read_to_string(root.join(name)).expect("read replayed file")
}
