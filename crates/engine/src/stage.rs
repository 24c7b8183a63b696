// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stage contract and shared stage state

use crate::error::StageError;
use crate::log::LogWriter;
use crate::pipeline::Pipeline;
use async_trait::async_trait;
use kiln_core::{CancellationToken, LogStream, ReapSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, watch};

struct StateInner {
    name: Mutex<String>,
    completed: AtomicBool,
    disabled: AtomicBool,
    transient: AtomicBool,
    check_stdout: AtomicBool,
    active: AtomicBool,
    stdout_path: Mutex<Option<PathBuf>>,
    pause: watch::Sender<u32>,
}

/// Flags and pause counter shared by every stage.
///
/// Clones refer to the same state, so a stage can hand a clone to a
/// background task that later unpauses it.
#[derive(Clone)]
pub struct StageState {
    inner: Arc<StateInner>,
}

impl StageState {
    pub fn new(name: impl Into<String>) -> Self {
        let (pause, _) = watch::channel(0);
        Self {
            inner: Arc::new(StateInner {
                name: Mutex::new(name.into()),
                completed: AtomicBool::new(false),
                disabled: AtomicBool::new(false),
                transient: AtomicBool::new(false),
                check_stdout: AtomicBool::new(false),
                active: AtomicBool::new(false),
                stdout_path: Mutex::new(None),
                pause,
            }),
        }
    }

    pub fn name(&self) -> String {
        self.inner.name.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.inner.name.lock().unwrap_or_else(|e| e.into_inner()) = name.into();
    }

    pub fn completed(&self) -> bool {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn set_completed(&self, completed: bool) {
        self.inner.completed.store(completed, Ordering::Release);
    }

    pub fn disabled(&self) -> bool {
        self.inner.disabled.load(Ordering::Acquire)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.inner.disabled.store(disabled, Ordering::Release);
    }

    /// Transient stages run every time, even when completed.
    pub fn transient(&self) -> bool {
        self.inner.transient.load(Ordering::Acquire)
    }

    pub fn set_transient(&self, transient: bool) {
        self.inner.transient.store(transient, Ordering::Release);
    }

    pub fn check_stdout(&self) -> bool {
        self.inner.check_stdout.load(Ordering::Acquire)
    }

    pub fn set_check_stdout(&self, check_stdout: bool) {
        self.inner.check_stdout.store(check_stdout, Ordering::Release);
    }

    pub fn active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.inner.active.store(active, Ordering::Release);
    }

    pub fn stdout_path(&self) -> Option<PathBuf> {
        self.inner
            .stdout_path
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_stdout_path(&self, path: Option<PathBuf>) {
        *self.inner.stdout_path.lock().unwrap_or_else(|e| e.into_inner()) = path;
    }

    pub fn pause_count(&self) -> u32 {
        *self.inner.pause.borrow()
    }

    pub fn pause(&self) {
        self.inner.pause.send_modify(|n| *n += 1);
    }

    /// Fails with [`StageError::UnbalancedUnpause`] when the stage is not paused.
    pub fn unpause(&self) -> Result<(), StageError> {
        let mut released = false;
        self.inner.pause.send_if_modified(|n| {
            if *n == 0 {
                return false;
            }
            *n -= 1;
            released = true;
            true
        });
        if released {
            return Ok(());
        }
        let stage = self.name();
        tracing::error!(stage = %stage, "unpause without a matching pause");
        Err(StageError::UnbalancedUnpause { stage })
    }

    /// Pause now and return a handle that unpauses exactly once, either
    /// explicitly or when dropped.
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause();
        PauseHandle {
            state: Some(self.clone()),
        }
    }

    /// Resolves once the pause count is zero.
    pub async fn wait_unpaused(&self) {
        let mut rx = self.inner.pause.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl std::fmt::Debug for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageState")
            .field("name", &self.name())
            .field("completed", &self.completed())
            .field("disabled", &self.disabled())
            .field("transient", &self.transient())
            .field("pause_count", &self.pause_count())
            .finish()
    }
}

/// An outstanding pause on a stage.
#[must_use = "dropping a PauseHandle unpauses the stage immediately"]
pub struct PauseHandle {
    state: Option<StageState>,
}

impl PauseHandle {
    pub fn unpause(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(state) = self.state.take() {
            if let Err(e) = state.unpause() {
                tracing::error!(error = %e, "pause handle released twice");
            }
        }
    }
}

impl Drop for PauseHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Where a running stage writes its output.
///
/// Stdout goes to the stage's `stdout_path` file when one is set, otherwise
/// to the pipeline's log observers. Stderr always goes to the observers.
#[derive(Clone)]
pub struct StageLog {
    writer: LogWriter,
    stdout_file: Option<mpsc::UnboundedSender<FileOp>>,
}

enum FileOp {
    Line(String),
    Flush(oneshot::Sender<()>),
}

/// Append lines to `file` from a background task until every sender drops.
fn spawn_file_writer(file: tokio::fs::File) -> mpsc::UnboundedSender<FileOp> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut out = BufWriter::new(file);
        while let Some(op) = rx.recv().await {
            match op {
                FileOp::Line(mut line) => {
                    line.push('\n');
                    if let Err(e) = out.write_all(line.as_bytes()).await {
                        tracing::warn!(error = %e, "failed to write stage stdout");
                    }
                }
                FileOp::Flush(done) => {
                    if let Err(e) = out.flush().await {
                        tracing::warn!(error = %e, "failed to flush stage stdout");
                    }
                    let _ = done.send(());
                }
            }
        }
        if let Err(e) = out.flush().await {
            tracing::warn!(error = %e, "failed to flush stage stdout");
        }
    });
    tx
}

impl StageLog {
    pub fn new(writer: LogWriter) -> Self {
        Self {
            writer,
            stdout_file: None,
        }
    }

    /// Truncate or create `path` and send stdout there.
    pub async fn redirect_stdout(mut self, path: &Path) -> std::io::Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        self.stdout_file = Some(spawn_file_writer(file));
        Ok(self)
    }

    pub fn log(&self, stream: LogStream, message: impl Into<String>) {
        let message = message.into();
        if let (LogStream::Stdout, Some(file)) = (stream, &self.stdout_file) {
            if file.send(FileOp::Line(message)).is_err() {
                tracing::warn!("stage stdout writer has stopped");
            }
            return;
        }
        self.writer.write(stream, message);
    }

    /// Wait until every line logged so far has reached the stdout file.
    pub async fn flush(&self) {
        let Some(file) = &self.stdout_file else {
            return;
        };
        let (done, written) = oneshot::channel();
        if file.send(FileOp::Flush(done)).is_ok() {
            let _ = written.await;
        }
    }

    pub fn stdout(&self, message: impl Into<String>) {
        self.log(LogStream::Stdout, message);
    }

    pub fn stderr(&self, message: impl Into<String>) {
        self.log(LogStream::Stderr, message);
    }
}

/// A unit of build work bound to a phase.
///
/// Implementations own a [`StageState`] and provide `execute`; everything
/// else has defaults. The pipeline is only borrowed for the duration of a
/// call and must not be stored.
#[async_trait]
pub trait Stage: Send + Sync {
    fn state(&self) -> &StageState;

    /// Whether [`Stage::query`] does anything. Stages with a query stay in
    /// the plan even when completed.
    fn has_query(&self) -> bool {
        false
    }

    /// Runs before execute while the stage is paused. May take additional
    /// pauses (see [`StageState::pause_handle`]) or mark the stage
    /// not completed.
    fn query(&self, _pipeline: &Pipeline, _cancel: &CancellationToken) {}

    async fn execute(
        &self,
        pipeline: &Pipeline,
        log: &StageLog,
        cancel: &CancellationToken,
    ) -> Result<(), StageError>;

    async fn clean(
        &self,
        _pipeline: &Pipeline,
        _log: &StageLog,
        _cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        Ok(())
    }

    /// Absorb the work of the stage that follows. Returning true removes
    /// `next` from the current run.
    fn chain(&self, _next: &dyn Stage) -> bool {
        false
    }

    /// Register files to delete before a rebuild.
    fn reap(&self, _pipeline: &Pipeline, _reaper: &mut ReapSet) {}

    fn name(&self) -> String {
        self.state().name()
    }
}

/// Outcome of [`run_stage`] when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageRun {
    Executed,
    /// The query left the stage completed, so execute was skipped
    UpToDate,
}

struct ActiveGuard<'a>(&'a StageState);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.set_active(false);
    }
}

/// Drive one stage through query, pause wait and execute.
pub(crate) async fn run_stage(
    stage: &dyn Stage,
    pipeline: &Pipeline,
    log: &StageLog,
    cancel: &CancellationToken,
) -> Result<StageRun, StageError> {
    let state = stage.state();
    state.set_active(true);
    let _active = ActiveGuard(state);

    state.pause();
    if stage.has_query() {
        stage.query(pipeline, cancel);
    }
    state.unpause()?;

    if state.pause_count() > 0 {
        tracing::debug!(stage = %state.name(), pauses = state.pause_count(), "waiting for unpause");
    }
    tokio::select! {
        _ = state.wait_unpaused() => {}
        _ = cancel.cancelled() => return Err(StageError::Cancelled),
    }

    if stage.has_query() && state.completed() && !state.transient() {
        return Ok(StageRun::UpToDate);
    }

    stage.execute(pipeline, log, cancel).await?;
    Ok(StageRun::Executed)
}

#[cfg(test)]
#[path = "stage_tests.rs"]
mod tests;
