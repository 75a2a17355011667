use std::time::{Duration, Instant};

use core_scoring::{Driver, DriverError, Metrics, PassthroughFormatter, SchedulerConfig, SchedulerKind};

fn spawn_driver(
    command: &str,
    args: &[&str],
    kind: SchedulerKind,
) -> Driver<(), String, PassthroughFormatter> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    Driver::spawn(
        command,
        &args,
        PassthroughFormatter,
        kind,
        false,
        false,
        SchedulerConfig::default(),
    )
    .unwrap()
}

fn spawn_driver_with_config(
    command: &str,
    args: &[&str],
    kind: SchedulerKind,
    config: SchedulerConfig,
) -> Driver<(), String, PassthroughFormatter> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    Driver::spawn(command, &args, PassthroughFormatter, kind, false, false, config).unwrap()
}

fn spawn_audit_driver(command: &str, args: &[&str]) -> Driver<(), String, PassthroughFormatter> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    Driver::spawn(
        command,
        &args,
        PassthroughFormatter,
        SchedulerKind::Blocking,
        false,
        true,
        SchedulerConfig::default(),
    )
    .unwrap()
}

// S1 — happy path, all items scored, blocking scheduler.
#[test]
fn happy_path_blocking_scores_all_items_in_order() {
    let mut driver = spawn_driver("awk", &["{ print 0.1 * NR }"], SchedulerKind::Blocking);
    let items: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let batch = driver
        .predict(&(), &items, Duration::from_millis(500), None, None)
        .unwrap();
    assert_eq!(batch.len(), 3);
    assert!(!batch.truncated());
    assert!((batch.scores()[0] - 0.1).abs() < 1e-9);
    assert!((batch.scores()[2] - 0.3).abs() < 1e-9);
}

// S1 again, non-blocking scheduler — same observable contract.
#[test]
#[cfg(unix)]
fn happy_path_nonblocking_scores_all_items_in_order() {
    let mut driver = spawn_driver("awk", &["{ print 0.1 * NR }"], SchedulerKind::NonBlocking);
    let items: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let batch = driver
        .predict(&(), &items, Duration::from_millis(500), None, None)
        .unwrap();
    assert_eq!(batch.len(), 3);
    assert!(!batch.truncated());
}

// S3 — zero items, call returns promptly with nothing written.
#[test]
fn zero_items_returns_empty_without_writing() {
    let mut driver = spawn_driver("cat", &[], SchedulerKind::Blocking);
    let items: Vec<String> = vec![];
    let mut metrics = Metrics::new();
    let start = Instant::now();
    let batch = driver
        .predict(&(), &items, Duration::from_millis(5), Some(&mut metrics), None)
        .unwrap();
    assert!(batch.is_empty());
    assert_eq!(metrics.lines_written, 0);
    assert!(start.elapsed() < Duration::from_millis(50));
}

// S4 — a deadline-truncated call leaves a residual that the next call drains
// before touching its own items.
//
// `blocking::run` reads each in-flight batch to completion with no deadline
// check inside that read loop (§4.4: "keep reading opportunistically only if
// a read is already started"), so truncation can only land on a batch
// boundary. `batch_size = 1` forces one in-flight batch per item, and the
// engine's 50ms-per-line delay against a 10ms deadline gives the outer loop
// room to observe the deadline between batches well before the full item
// sequence is scored.
#[test]
fn residual_from_a_truncated_call_is_drained_by_the_next() {
    let mut driver = spawn_driver_with_config(
        "sh",
        &["-c", "while IFS= read -r line; do sleep 0.05; echo 0.5; done"],
        SchedulerKind::Blocking,
        SchedulerConfig::default().with_batch_size(1),
    );
    let items: Vec<String> = (0..5).map(|i| format!("item{i}")).collect();

    let first = driver
        .predict(&(), &items, Duration::from_millis(10), None, None)
        .unwrap();
    assert!(first.truncated());
    let owed_before = driver.engine_owes_us();
    assert!(owed_before > 0);

    let second = driver
        .predict(&(), &[], Duration::from_millis(500), None, None)
        .unwrap();
    assert!(second.is_empty());
    assert!(driver.engine_owes_us() < owed_before);
}

// S5 — engine death surfaces as EngineGone and poisons the driver.
#[test]
fn dead_engine_surfaces_engine_gone_and_poisons_driver() {
    let mut driver = spawn_driver("sh", &["-c", "kill -9 $$"], SchedulerKind::Blocking);
    std::thread::sleep(Duration::from_millis(50));
    let items: Vec<String> = vec!["x".into()];
    let err = driver
        .predict(&(), &items, Duration::from_millis(100), None, None)
        .unwrap_err();
    assert!(matches!(err, DriverError::EngineGone));
    assert!(driver.poisoned());

    // Fails fast on the second call too, without touching the dead child again.
    let err = driver
        .predict(&(), &items, Duration::from_millis(100), None, None)
        .unwrap_err();
    assert!(matches!(err, DriverError::EngineGone));
    driver.close().unwrap();
}

#[test]
fn metrics_record_batches_and_lines() {
    let mut driver = spawn_driver("awk", &["{ print 0.1 * NR }"], SchedulerKind::Blocking);
    let items: Vec<String> = vec!["a".into(), "b".into()];
    let mut metrics = Metrics::new();
    let batch = driver
        .predict(&(), &items, Duration::from_millis(500), Some(&mut metrics), None)
        .unwrap();
    assert_eq!(batch.len(), 2);
    assert_eq!(metrics.lines_written, 2);
    assert_eq!(metrics.lines_read, 2);
    assert!(metrics.batches_written >= 1);
}

// S6 (end-to-end) — explain_vw_line round-trips through a real child.
#[test]
fn explain_vw_line_parses_audit_output_from_a_real_child() {
    let audit_line = "c^c8*f^f1:1:1:0.5@0";
    let script = format!("read line; printf '%s\\n' '{audit_line}'");
    let mut driver = spawn_audit_driver("sh", &["-c", &script]);

    let record = driver.explain_vw_line(&(), &"probe".to_string()).unwrap();
    assert_eq!(record.contributions.len(), 1);
    assert_eq!(record.contributions[0].namespace, "c");
    assert_eq!(record.contributions[0].weight, 0.5);
}

#[test]
fn predict_rejects_calls_on_an_audit_mode_driver() {
    let mut driver = spawn_audit_driver("cat", &[]);
    let err = driver
        .predict(&(), &[], Duration::from_millis(10), None, None)
        .unwrap_err();
    assert!(matches!(err, DriverError::AuditModeActive));
}
