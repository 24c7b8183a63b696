// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::process::{FakeProcessAdapter, FakeProcessScript, ProcessCall};
use crate::reaper::FakeReaperAdapter;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;

/// A writer that captures log output for testing
#[derive(Clone, Default)]
struct CapturedLogs {
    logs: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLogs {
    fn new() -> Self {
        Self::default()
    }

    fn contents(&self) -> String {
        let logs = self.logs.lock().unwrap();
        String::from_utf8_lossy(&logs).to_string()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.logs.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run a test with captured tracing output
fn with_tracing<F, Fut>(f: F) -> (String, Fut::Output)
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future,
{
    let logs = CapturedLogs::new();
    let logs_clone = logs.clone();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_writer(logs_clone)
        .with_ansi(false)
        .without_time()
        .finish();

    let result = tracing::subscriber::with_default(subscriber, || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f())
    });

    (logs.contents(), result)
}

// =============================================================================
// Precondition validation tests
// =============================================================================

#[tokio::test]
async fn traced_process_rejects_nonexistent_cwd() {
    let fake = FakeProcessAdapter::new();
    let traced = TracedProcessAdapter::new(fake.clone());

    let spec = ProcessSpec::new(["make"]).with_cwd("/nonexistent/path");
    let err = traced.spawn(&spec).await.err().unwrap();

    assert!(
        err.to_string().contains("working directory does not exist"),
        "Expected error about working directory, got: {}",
        err
    );
    // inner adapter never sees the call
    assert!(fake.calls().is_empty());
}

// =============================================================================
// Tracing output verification tests
// =============================================================================

#[test]
fn traced_process_spawn_logs_entry_and_exit() {
    let (logs, result) = with_tracing(|| async {
        let fake = FakeProcessAdapter::new();
        fake.script("make", FakeProcessScript::exit_code(2));
        let traced = TracedProcessAdapter::new(fake);

        let spec = ProcessSpec::new(["make", "all"]).with_cwd("/tmp");
        let mut handle = traced.spawn(&spec).await.unwrap();
        handle.wait().await
    });

    assert_eq!(result.unwrap(), ProcessExit::code(2));
    assert!(logs.contains("process.spawn"), "Should log span name. Logs:\n{}", logs);
    assert!(logs.contains("make all"), "Should log argv. Logs:\n{}", logs);
    assert!(logs.contains("starting"), "Should log entry message. Logs:\n{}", logs);
    assert!(logs.contains("process started"), "Should log spawn. Logs:\n{}", logs);
    assert!(logs.contains("process exited"), "Should log exit. Logs:\n{}", logs);
    assert!(logs.contains("elapsed_ms"), "Should log timing. Logs:\n{}", logs);
}

#[test]
fn traced_process_logs_precondition_failure() {
    let (logs, result) = with_tracing(|| async {
        let traced = TracedProcessAdapter::new(FakeProcessAdapter::new());
        let spec = ProcessSpec::new(["make"]).with_cwd("/nonexistent/path");
        traced.spawn(&spec).await.map(|_| ())
    });

    assert!(result.is_err());
    assert!(
        logs.contains("working directory does not exist"),
        "Should log precondition failure. Logs:\n{}",
        logs
    );
}

#[test]
fn traced_process_kill_logs_operation() {
    let (logs, _) = with_tracing(|| async {
        let fake = FakeProcessAdapter::new();
        fake.script("sleep", FakeProcessScript::hanging());
        let traced = TracedProcessAdapter::new(fake);

        let mut handle = traced.spawn(&ProcessSpec::new(["sleep"])).await.unwrap();
        handle.kill().await
    });

    assert!(logs.contains("killed"), "Should log kill. Logs:\n{}", logs);
}

#[test]
fn traced_reaper_logs_paths_and_count() {
    let (logs, result) = with_tracing(|| async {
        let traced = TracedReaperAdapter::new(FakeReaperAdapter::new());
        let mut set = ReapSet::new();
        set.add_directory("/tmp/kiln-build");
        set.add_file("/tmp/kiln-src/configure");
        traced.reap(&set).await
    });

    assert_eq!(result.unwrap(), 2);
    assert!(logs.contains("reaper.reap"), "Should log span name. Logs:\n{}", logs);
    assert!(logs.contains("/tmp/kiln-build"), "Should log paths. Logs:\n{}", logs);
    assert!(logs.contains("reaped"), "Should log completion. Logs:\n{}", logs);
}

#[test]
fn traced_reaper_logs_failure() {
    let (logs, result) = with_tracing(|| async {
        let fake = FakeReaperAdapter::new();
        fake.fail("read-only filesystem");
        let traced = TracedReaperAdapter::new(fake);
        let mut set = ReapSet::new();
        set.add_directory("/ro/build");
        traced.reap(&set).await
    });

    assert!(result.is_err());
    assert!(logs.contains("reap failed"), "Should log failure. Logs:\n{}", logs);
}

// =============================================================================
// Delegation tests - verify traced wrapper delegates to inner adapter
// =============================================================================

#[tokio::test]
async fn traced_process_delegates_spawn_to_inner() {
    let fake = FakeProcessAdapter::new();
    let traced = TracedProcessAdapter::new(fake.clone());

    let mut spec = ProcessSpec::shell("make install").with_cwd("/tmp");
    spec.setenv("DESTDIR", "/tmp/stage");
    traced.spawn(&spec).await.unwrap();

    let calls = fake.calls();
    assert_eq!(calls.len(), 1);
    match &calls[0] {
        ProcessCall::Spawn { spec: seen, .. } => assert_eq!(seen, &spec),
        other => panic!("Expected Spawn call, got {:?}", other),
    }
}

#[tokio::test]
async fn traced_reaper_delegates_to_inner() {
    let fake = FakeReaperAdapter::new();
    let traced = TracedReaperAdapter::new(fake.clone());

    let mut set = ReapSet::new();
    set.add_directory("/tmp/kiln-build");
    traced.reap(&set).await.unwrap();

    assert_eq!(fake.paths(), vec![std::path::PathBuf::from("/tmp/kiln-build")]);
}
