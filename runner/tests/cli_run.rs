//! CLI tests for `codemod-runner run`.
//!
//! Spawns the runner binary against temp trees and checks exit codes, the
//! notification stream and the files left behind, for both worker kinds.

use std::path::Path;
use std::process::{Command, Output};

use codemod_runner::exit_codes;
use codemod_runner::io::case_log::read_case_file;
use codemod_runner::test_support::TestTree;

const VAR_TO_LET: &str =
    "{% if 'var ' in content %}{{ report(content | replace('var ', 'let ')) }}{% endif %}";

fn runner(args: &[&str], target: &Path, transform: Option<&Path>) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_codemod-runner"));
    cmd.arg("run").arg(target);
    if let Some(transform) = transform {
        cmd.arg("--transform").arg(transform);
    }
    cmd.args(args).output().expect("codemod-runner run")
}

fn last_notification(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.lines().last().expect("at least one notification");
    serde_json::from_str(line).expect("json notification")
}

fn transform_file(source: &str) -> TestTree {
    TestTree::new(&[("transform.j2", source)])
}

#[test]
fn thread_workers_rewrite_matching_files() {
    let tree = TestTree::new(&[("a.js", "var a = 1;\n"), ("b.js", "let b;\n")]);
    let transform = transform_file(VAR_TO_LET);

    let output = runner(
        &["--worker", "thread", "--pool-size", "2"],
        tree.root(),
        Some(&transform.path("transform.j2")),
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(tree.read("a.js"), "let a = 1;\n");
    assert_eq!(tree.read("b.js"), "let b;\n");
    let finish = last_notification(&output);
    assert_eq!(finish["kind"], "finish");
    assert_eq!(finish["processed"], 2);
    assert_eq!(finish["changed"], 1);
}

#[test]
fn process_workers_rewrite_matching_files() {
    let tree = TestTree::new(&[
        ("a.js", "var a;\n"),
        ("b.js", "var b;\n"),
        ("c.js", "const c = 3;\n"),
    ]);
    let transform = transform_file(VAR_TO_LET);

    let output = runner(
        &["--worker", "process", "--pool-size", "2"],
        tree.root(),
        Some(&transform.path("transform.j2")),
    );

    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(tree.read("a.js"), "let a;\n");
    assert_eq!(tree.read("b.js"), "let b;\n");
    assert_eq!(tree.read("c.js"), "const c = 3;\n");
    assert_eq!(last_notification(&output)["changed"], 2);
}

#[test]
fn dry_run_leaves_files_and_writes_a_verified_case() {
    let tree = TestTree::new(&[("a.js", "var a;\n")]);
    let transform = transform_file(VAR_TO_LET);

    let output = runner(
        &["--dry-run", "--arg", "mode=strict"],
        tree.root(),
        Some(&transform.path("transform.j2")),
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(tree.read("a.js"), "var a;\n");
    let finish = last_notification(&output);
    assert_eq!(finish["dry_run"], true);
    let case_path = finish["case_path"].as_str().expect("case path");
    let log = read_case_file(Path::new(case_path))
        .expect("read case")
        .into_verified()
        .expect("verified case");
    assert_eq!(log.jobs.len(), 1);
    assert_eq!(log.case.argument_record["mode"], "strict");
}

#[test]
fn per_file_errors_exit_partial() {
    let tree = TestTree::new(&[("good.json", "{\"name\": \"x\"}"), ("bad.json", "nope")]);
    let transform = transform_file("{{ report((content | parse_json).name) }}");

    let output = runner(&[], tree.root(), Some(&transform.path("transform.j2")));

    assert_eq!(output.status.code(), Some(exit_codes::PARTIAL));
    assert_eq!(tree.read("good.json"), "x");
    assert_eq!(tree.read("bad.json"), "nope");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout
            .lines()
            .any(|line| line.contains("\"kind\":\"error\"") && line.contains("bad.json"))
    );
    assert_eq!(last_notification(&output)["errors"], 1);
}

#[cfg(target_os = "linux")]
#[test]
fn runaway_allocation_fails_only_its_own_file() {
    let tree = TestTree::new(&[("a.txt", "boom"), ("b.txt", "fine")]);
    let transform = transform_file(
        "{% if content == 'boom' %}{% set s = 'x' * 4000000000 %}{{ report(s) }}\
         {% else %}{{ report(content | upper) }}{% endif %}",
    );

    let output = runner(
        &["--worker", "process", "--pool-size", "1"],
        tree.root(),
        Some(&transform.path("transform.j2")),
    );

    assert_eq!(
        output.status.code(),
        Some(exit_codes::PARTIAL),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert_eq!(tree.read("a.txt"), "boom");
    assert_eq!(tree.read("b.txt"), "FINE");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout
            .lines()
            .any(|line| line.contains("\"kind\":\"error\"") && line.contains("a.txt"))
    );
    let finish = last_notification(&output);
    assert_eq!(finish["kind"], "finish");
    assert_eq!(finish["errors"], 1);
}

#[test]
fn missing_transform_is_invalid() {
    let tree = TestTree::new(&[("a.js", "var a;\n")]);

    let output = runner(&[], tree.root(), Some(&tree.path("missing.j2")));

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(!tree.exists(".codemod"));
}

#[test]
fn broken_template_fails_before_any_work() {
    let tree = TestTree::new(&[("a.js", "var a;\n")]);
    let transform = transform_file("{% if %}");

    let output = runner(&[], tree.root(), Some(&transform.path("transform.j2")));

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(!tree.exists(".codemod"));
    assert_eq!(tree.read("a.js"), "var a;\n");
}

#[cfg(unix)]
#[test]
fn command_engine_pipes_files_through_a_program() {
    let tree = TestTree::new(&[("a.txt", "abc\n"), ("b.txt", "xyz\n")]);

    let output = runner(&["--", "tr", "a", "A"], tree.root(), None);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(tree.read("a.txt"), "Abc\n");
    assert_eq!(tree.read("b.txt"), "xyz\n");
}
