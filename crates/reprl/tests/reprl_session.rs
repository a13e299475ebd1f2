//! End-to-end tests: the real supervisor driving the mock REPRL shell.
//!
//! Every test uses its own worker id so the shared-memory names and data
//! channels never collide, which also lets the tests run concurrently.

use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use reprl::{
    JsEngine, MAX_DATA_SIZE, ReprlError, TargetConfig, Worker, WorkerError,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn mock_config() -> TargetConfig {
    TargetConfig::new(
        JsEngine::Jsc,
        PathBuf::from(env!("CARGO_BIN_EXE_reprl-mock-shell")),
    )
}

fn mock_worker(id: usize) -> Worker {
    Worker::new(id, &mock_config()).unwrap()
}

#[test]
fn clean_execution_captures_stdout() {
    let mut worker = mock_worker(0);
    let execution = worker.execute(b"stdout:1", TIMEOUT, false).unwrap();
    assert!(execution.status.exited());
    assert_eq!(execution.status.exit_code(), 0);
    assert_eq!(worker.fetch_stdout().unwrap(), b"1\n");
}

#[test]
fn stderr_and_fuzzout_are_captured_separately() {
    let mut worker = mock_worker(1);
    worker
        .execute(b"stderr:oops\nfuzzout:fuzz data", TIMEOUT, false)
        .unwrap();
    assert_eq!(worker.fetch_stderr().unwrap(), b"oops\n");
    assert_eq!(worker.fetch_fuzzout().unwrap(), b"fuzz data");
    assert_eq!(worker.fetch_stdout().unwrap(), b"");
}

#[test]
fn crash_is_reported_as_the_terminating_signal() {
    let mut worker = mock_worker(2);
    let execution = worker.execute(b"segv", TIMEOUT, false).unwrap();
    assert!(execution.status.signaled());
    assert_eq!(execution.status.term_signal(), libc::SIGSEGV as u32);
    assert!(worker.child_pid().is_none());
}

#[test]
fn timeout_kills_the_child_and_the_next_execution_respawns() {
    let mut worker = mock_worker(3);
    let execution = worker
        .execute(b"sleep:30000", Duration::from_millis(100), false)
        .unwrap();
    assert!(execution.status.timed_out());
    assert_eq!(execution.status.raw(), 0x10000);
    assert!(worker.child_pid().is_none());

    let execution = worker.execute(b"stdout:ok", TIMEOUT, false).unwrap();
    assert!(execution.status.exited());
    assert_eq!(worker.fetch_stdout().unwrap(), b"ok\n");
}

#[test]
fn zero_timeout_reports_a_timeout_immediately() {
    let mut worker = mock_worker(4);
    let execution = worker.execute(b"sleep:5000", Duration::ZERO, false).unwrap();
    assert!(execution.status.timed_out());
}

#[test]
fn fresh_coverage_is_discovered_exactly_once() {
    let mut worker = mock_worker(5);

    worker.execute(b"edges:5,9", TIMEOUT, false).unwrap();
    assert_eq!(worker.evaluate(), vec![5, 9]);
    assert_eq!(worker.coverage().found_edges(), 2);

    worker.execute(b"edges:9,11", TIMEOUT, false).unwrap();
    assert_eq!(worker.evaluate(), vec![11]);
    assert_eq!(worker.coverage().found_edges(), 3);
}

#[test]
fn coverage_survives_a_save_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coverage.bin");
    let mut worker = mock_worker(6);

    worker.execute(b"edges:5,9,11", TIMEOUT, false).unwrap();
    worker.evaluate();
    assert_eq!(worker.coverage().save_virgin_bits(&path).unwrap(), 3);

    worker.coverage_mut().reset_state();
    assert_eq!(worker.coverage_mut().load_virgin_bits(&path).unwrap(), 3);

    worker.execute(b"edges:5", TIMEOUT, false).unwrap();
    assert_eq!(worker.evaluate(), Vec::<u32>::new());
    worker.execute(b"edges:13", TIMEOUT, false).unwrap();
    assert_eq!(worker.evaluate(), vec![13]);
}

#[test]
fn externally_killed_child_is_detected_between_executions() {
    let mut worker = mock_worker(7);
    worker.execute(b"stdout:hi", TIMEOUT, false).unwrap();

    let pid = worker.child_pid().unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let err = worker.execute(b"stdout:again", TIMEOUT, false).unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Reprl(ReprlError::SignaledBetweenExecutions(signal))
            if signal == libc::SIGKILL
    ));
    assert!(worker.last_error().unwrap().contains("signal"));

    // The caller retries and gets a fresh child.
    let execution = worker.execute(b"stdout:again", TIMEOUT, false).unwrap();
    assert!(execution.status.exited());
    assert_eq!(worker.fetch_stdout().unwrap(), b"again\n");
}

#[test]
fn death_during_execution_synthesizes_the_exit_status() {
    let mut worker = mock_worker(8);
    let execution = worker.execute(b"exit:7", TIMEOUT, false).unwrap();
    assert!(execution.status.exited());
    assert_eq!(execution.status.exit_code(), 7);
    assert!(worker.child_pid().is_none());

    let execution = worker.execute(b"stdout:back", TIMEOUT, false).unwrap();
    assert!(execution.status.exited());
}

#[test]
fn nonzero_script_status_is_passed_through() {
    let mut worker = mock_worker(9);
    let execution = worker.execute(b"status:42", TIMEOUT, false).unwrap();
    assert!(execution.status.exited());
    assert_eq!(execution.status.exit_code(), 42);
    // The child is still alive; this was a script-level failure.
    assert!(worker.child_pid().is_some());
}

#[test]
fn empty_script_executes_cleanly() {
    let mut worker = mock_worker(10);
    let execution = worker.execute(b"", TIMEOUT, false).unwrap();
    assert!(execution.status.exited());
    assert_eq!(execution.status.exit_code(), 0);
}

#[test]
fn script_size_is_bounded_by_the_channel() {
    let mut worker = mock_worker(11);

    let too_large = vec![b'\n'; MAX_DATA_SIZE + 1];
    let err = worker.execute(&too_large, TIMEOUT, false).unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Reprl(ReprlError::ScriptTooLarge(_))
    ));

    let max_sized = vec![b'\n'; MAX_DATA_SIZE];
    let execution = worker
        .execute(&max_sized, Duration::from_secs(60), false)
        .unwrap();
    assert!(execution.status.exited());
}

#[test]
fn fresh_instance_replaces_the_child() {
    let mut worker = mock_worker(12);
    worker.execute(b"stdout:first", TIMEOUT, false).unwrap();
    let first_pid = worker.child_pid().unwrap();

    worker.execute(b"stdout:second", TIMEOUT, true).unwrap();
    let second_pid = worker.child_pid().unwrap();
    assert_ne!(first_pid, second_pid);
    assert_eq!(worker.fetch_stdout().unwrap(), b"second\n");
}

#[test]
fn child_sees_only_the_wired_descriptors() {
    let mut worker = mock_worker(13);
    worker.execute(b"listfds", TIMEOUT, false).unwrap();

    let stdout = worker.fetch_stdout().unwrap().to_vec();
    let fds: BTreeSet<i32> = String::from_utf8(stdout)
        .unwrap()
        .lines()
        .map(|line| line.parse().unwrap())
        .collect();

    let expected: BTreeSet<i32> = [0, 1, 2, 100, 101, 102, 103].into();
    assert!(expected.is_subset(&fds), "missing protocol fds in {fds:?}");
    // Listing /proc/self/fd itself holds one transient descriptor open.
    let extras: Vec<i32> = fds.difference(&expected).copied().collect();
    assert!(extras.len() <= 1, "leaked descriptors: {extras:?}");
}

#[test]
fn execution_time_tracks_the_child() {
    let mut worker = mock_worker(14);
    let execution = worker.execute(b"sleep:200", TIMEOUT, false).unwrap();
    assert!(execution.status.exited());
    assert!(execution.execution_time >= Duration::from_millis(200));
}
