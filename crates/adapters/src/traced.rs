// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Traced adapter wrappers for consistent observability

use crate::process::{OutputReader, ProcessAdapter, ProcessError, ProcessHandle};
use crate::reaper::{ReapError, ReaperAdapter};
use async_trait::async_trait;
use kiln_core::{ProcessExit, ProcessSpec, ReapSet};
use std::time::Instant;
use tracing::Instrument;

/// Wrapper that adds tracing to any ProcessAdapter
#[derive(Clone)]
pub struct TracedProcessAdapter<P> {
    inner: P,
}

impl<P> TracedProcessAdapter<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<P: ProcessAdapter> ProcessAdapter for TracedProcessAdapter<P> {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let program = spec.program().unwrap_or_default().to_string();
        let span = tracing::info_span!("process.spawn", program = %program);

        async move {
            tracing::info!(
                argv = %spec,
                output = ?spec.output,
                env_count = spec.env.len(),
                "starting"
            );

            // Precondition: cwd must exist
            if let Some(cwd) = &spec.cwd {
                if !cwd.is_dir() {
                    tracing::error!(cwd = %cwd.display(), "working directory does not exist");
                    return Err(ProcessError::SpawnFailed(format!(
                        "working directory does not exist: {}",
                        cwd.display()
                    )));
                }
            }

            let start = Instant::now();
            let result = self.inner.spawn(spec).await;
            let elapsed = start.elapsed();

            match result {
                Ok(handle) => {
                    let id = handle.identifier();
                    tracing::info!(
                        id = %id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "process started"
                    );
                    Ok(Box::new(TracedProcessHandle {
                        inner: handle,
                        program,
                        started: Instant::now(),
                    }) as Box<dyn ProcessHandle>)
                }
                Err(e) => {
                    tracing::error!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        error = %e,
                        "spawn failed"
                    );
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}

struct TracedProcessHandle {
    inner: Box<dyn ProcessHandle>,
    program: String,
    started: Instant,
}

#[async_trait]
impl ProcessHandle for TracedProcessHandle {
    fn identifier(&self) -> String {
        self.inner.identifier()
    }

    fn take_stdout(&mut self) -> Option<OutputReader> {
        self.inner.take_stdout()
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        self.inner.take_stderr()
    }

    async fn wait(&mut self) -> Result<ProcessExit, ProcessError> {
        let result = self.inner.wait().await;
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match &result {
            Ok(exit) => tracing::info!(
                program = %self.program,
                id = %self.inner.identifier(),
                code = ?exit.code,
                signal = ?exit.signal,
                elapsed_ms,
                "process exited"
            ),
            Err(e) => tracing::error!(program = %self.program, error = %e, "wait failed"),
        }
        result
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        let result = self.inner.kill().await;
        // kill() failing is often acceptable (process already gone)
        match &result {
            Ok(()) => tracing::info!(program = %self.program, "killed"),
            Err(e) => {
                tracing::warn!(program = %self.program, error = %e, "kill failed (may be expected)")
            }
        }
        result
    }
}

/// Wrapper that adds tracing to any ReaperAdapter
#[derive(Clone)]
pub struct TracedReaperAdapter<R> {
    inner: R,
}

impl<R> TracedReaperAdapter<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: ReaperAdapter> ReaperAdapter for TracedReaperAdapter<R> {
    async fn reap(&self, set: &ReapSet) -> Result<usize, ReapError> {
        let span = tracing::info_span!("reaper.reap", entries = set.len());

        async move {
            for entry in set.iter() {
                tracing::debug!(path = %entry.path.display(), kind = ?entry.kind, "reaping");
            }

            let start = Instant::now();
            let result = self.inner.reap(set).await;
            let elapsed = start.elapsed();

            match &result {
                Ok(removed) => tracing::info!(
                    removed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "reaped"
                ),
                Err(e) => tracing::error!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "reap failed"
                ),
            }

            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
#[path = "traced_tests.rs"]
mod tests;
