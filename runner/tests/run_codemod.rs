//! Run-level tests: discovery, case log, notifications and apply.

use std::sync::Arc;

use codemod_runner::core::case_codec::JobKind;
use codemod_runner::core::types::{ArgumentRecord, EngineHint, MutationCommand};
use codemod_runner::io::apply::FsApplier;
use codemod_runner::io::case_log::read_case_file;
use codemod_runner::io::config::{RunConfig, load_config};
use codemod_runner::io::report::Reporter;
use codemod_runner::io::transformer::EngineFactory;
use codemod_runner::io::worker::ThreadSpawner;
use codemod_runner::recorder::path_from_uri;
use codemod_runner::run::{RunRequest, prepare_run, run_codemod};
use codemod_runner::test_support::{
    RecordingApplier, Script, ScriptedFactory, TestTree, thread_spawner,
};
use serde_json::Value;

fn request(tree: &TestTree, dry_run: bool) -> RunRequest {
    let mut config = RunConfig::default();
    config.pool_size = 3;
    config.tick_interval_ms = 25;
    let mut arguments = ArgumentRecord::new();
    arguments.insert("x".to_string(), serde_json::json!(1));
    RunRequest {
        target: tree.root().to_path_buf(),
        engine: EngineHint::Template,
        codemod_source: b"scripted".to_vec(),
        arguments,
        config,
        dry_run,
    }
}

fn notifications(out: Vec<u8>) -> Vec<Value> {
    String::from_utf8(out)
        .expect("utf8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

fn scripted() -> ScriptedFactory {
    ScriptedFactory::new()
        .on("a.txt", Script::Change("A"))
        .on("c.txt", Script::Change("C"))
        .on("d.txt", Script::Change("D"))
}

#[test]
fn dry_run_records_without_applying() {
    let tree = TestTree::new(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c"), ("d.txt", "d")]);
    let mut applier = RecordingApplier::default();
    let mut reporter = Reporter::new(Vec::new());

    let summary = run_codemod(
        request(&tree, true),
        thread_spawner(scripted()),
        &mut applier,
        &mut reporter,
    )
    .expect("run");

    assert!(applier.applied.is_empty());
    assert_eq!(tree.read("a.txt"), "a");
    assert_eq!(summary.changed, 3);
    assert_eq!(summary.progress.processed, 4);
    assert!(summary.is_clean());

    let readout = read_case_file(&summary.case_path).expect("read case");
    assert!(readout.trailer_verified());
    let log = readout.into_verified().expect("verified");
    assert_eq!(log.case.argument_record["x"], serde_json::json!(1));
    assert_eq!(
        log.case.absolute_target_path,
        tree.root().canonicalize().unwrap().display().to_string()
    );
    assert_eq!(log.jobs.len(), 3);
    assert!(log.jobs.iter().all(|job| job.kind == JobKind::RewriteFile));
    let mut bodies: Vec<String> = log
        .jobs
        .iter()
        .map(|job| std::fs::read_to_string(path_from_uri(&job.new_uri).unwrap()).unwrap())
        .collect();
    bodies.sort();
    assert_eq!(bodies, vec!["A", "C", "D"]);

    let lines = notifications(reporter.into_inner());
    let progress: Vec<u64> = lines
        .iter()
        .filter(|l| l["kind"] == "progress")
        .map(|l| l["processed"].as_u64().unwrap())
        .collect();
    assert_eq!(progress, vec![1, 2, 3, 4]);
    let finish = lines.last().expect("finish line");
    assert_eq!(finish["kind"], "finish");
    assert_eq!(finish["processed"], 4);
    assert_eq!(finish["total"], 4);
    assert_eq!(finish["dry_run"], true);
}

#[test]
fn wet_run_applies_commands() {
    let tree = TestTree::new(&[("a.txt", "a"), ("b.txt", "b"), ("c.txt", "c"), ("d.txt", "d")]);
    let mut reporter = Reporter::new(Vec::new());

    let summary = run_codemod(
        request(&tree, false),
        thread_spawner(scripted()),
        &mut FsApplier,
        &mut reporter,
    )
    .expect("run");

    assert!(summary.is_clean());
    assert_eq!(tree.read("a.txt"), "A");
    assert_eq!(tree.read("b.txt"), "b");
    assert_eq!(tree.read("d.txt"), "D");
}

#[test]
fn job_errors_are_reported_and_the_run_finishes() {
    let tree = TestTree::new(&[("a.txt", "a"), ("bad.txt", "b")]);
    let factory = ScriptedFactory::new()
        .on("a.txt", Script::Change("A"))
        .on("bad.txt", Script::Fail("cannot parse"));
    let mut applier = RecordingApplier::default();
    let mut reporter = Reporter::new(Vec::new());

    let summary = run_codemod(
        request(&tree, false),
        thread_spawner(factory),
        &mut applier,
        &mut reporter,
    )
    .expect("run");

    assert_eq!(summary.job_errors, 1);
    assert!(!summary.is_clean());
    assert_eq!(applier.applied.len(), 1);
    assert!(matches!(
        &applier.applied[0],
        MutationCommand::UpdateFile { new_data, .. } if new_data == "A"
    ));

    let lines = notifications(reporter.into_inner());
    let error = lines
        .iter()
        .find(|l| l["kind"] == "error")
        .expect("error line");
    assert!(error["path"].as_str().unwrap().ends_with("bad.txt"));
    assert!(error["message"].as_str().unwrap().contains("cannot parse"));
    assert_eq!(lines.last().unwrap()["errors"], 1);
}

#[test]
fn template_engine_runs_in_sandbox_end_to_end() {
    let tree = TestTree::new(&[
        ("src/a.ts", "var a = 1;\n"),
        ("src/b.ts", "const b = 2;\n"),
        ("src/c.md", "var c\n"),
    ]);
    let mut req = request(&tree, false);
    req.config.extensions = vec!["ts".to_string()];
    let source =
        "{% if 'var ' in content %}{{ report(content | replace('var ', 'let ')) }}{% endif %}";
    let factory = EngineFactory::new(Some(source), &req.config).expect("factory");
    let spawner = ThreadSpawner::new(Arc::new(factory), req.config.worker.stack_bytes);
    let mut reporter = Reporter::new(Vec::new());

    let summary = run_codemod(req, spawner, &mut FsApplier, &mut reporter).expect("run");

    assert_eq!(summary.progress.total, 2);
    assert_eq!(summary.changed, 1);
    assert_eq!(tree.read("src/a.ts"), "let a = 1;\n");
    assert_eq!(tree.read("src/b.ts"), "const b = 2;\n");
    assert_eq!(tree.read("src/c.md"), "var c\n");
}

#[test]
fn prepare_writes_preamble_and_effective_config() {
    let tree = TestTree::new(&[("a.txt", "a")]);
    let mut req = request(&tree, true);
    req.config.command.program = vec!["cat".to_string()];
    let prepared = prepare_run(req.clone()).expect("prepare");

    assert_eq!(prepared.files().len(), 1);
    assert!(prepared.case_dir().starts_with(tree.root().canonicalize().unwrap()));
    assert_eq!(
        load_config(&prepared.config_path()).expect("effective config"),
        req.config
    );

    // Preamble is durable before any job runs; the trailer is not there yet.
    let readout = read_case_file(&prepared.case_path()).expect("read");
    assert!(readout.case.is_some());
    assert!(!readout.trailer_verified());
}

#[test]
fn visible_case_dir_is_not_rediscovered() {
    let tree = TestTree::new(&[("a.txt", "a"), ("b.txt", "b")]);
    let mut req = request(&tree, true);
    req.config.case_dir = "cases".into();

    let first = run_codemod(
        req.clone(),
        thread_spawner(scripted()),
        &mut RecordingApplier::default(),
        &mut Reporter::new(Vec::new()),
    )
    .expect("first run");
    assert!(first.case_path.starts_with(tree.root().canonicalize().unwrap().join("cases")));

    let prepared = prepare_run(req).expect("second prepare");
    let root = tree.root().canonicalize().unwrap();
    assert_eq!(prepared.files(), [root.join("a.txt"), root.join("b.txt")]);
}
