// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stage that runs a single child process

use crate::error::StageError;
use crate::pipeline::Pipeline;
use crate::stage::{Stage, StageLog, StageState};
use async_trait::async_trait;
use kiln_adapters::{OutputReader, ProcessAdapter};
use kiln_core::{CancellationToken, LogStream, OutputMode, ProcessExit, ProcessSpec};
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;

/// Spawns its process spec on execute and, when set, its clean spec on clean.
///
/// Non-zero exit fails the stage unless `ignore_exit_status` is set. A
/// signal always fails it.
pub struct LauncherStage<P: ProcessAdapter> {
    state: StageState,
    processes: P,
    spec: Option<ProcessSpec>,
    clean_spec: Option<ProcessSpec>,
    ignore_exit_status: bool,
    use_pty: bool,
}

impl<P: ProcessAdapter> LauncherStage<P> {
    pub fn new(name: impl Into<String>, processes: P, spec: Option<ProcessSpec>) -> Self {
        Self {
            state: StageState::new(name),
            processes,
            spec,
            clean_spec: None,
            ignore_exit_status: false,
            use_pty: false,
        }
    }

    pub fn with_clean(mut self, spec: ProcessSpec) -> Self {
        self.clean_spec = Some(spec);
        self
    }

    pub fn with_ignore_exit_status(mut self, ignore: bool) -> Self {
        self.ignore_exit_status = ignore;
        self
    }

    /// Run the child on a pseudo-terminal. stdout and stderr arrive
    /// interleaved and are logged as stdout.
    pub fn with_pty(mut self, use_pty: bool) -> Self {
        self.use_pty = use_pty;
        self
    }

    pub fn spec(&self) -> Option<&ProcessSpec> {
        self.spec.as_ref()
    }

    pub fn clean_spec(&self) -> Option<&ProcessSpec> {
        self.clean_spec.as_ref()
    }

    pub fn ignore_exit_status(&self) -> bool {
        self.ignore_exit_status
    }

    pub fn use_pty(&self) -> bool {
        self.use_pty
    }

    async fn run(
        &self,
        spec: &ProcessSpec,
        log: &StageLog,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        let output = if self.use_pty {
            OutputMode::Pty
        } else {
            OutputMode::Piped
        };
        let spec = spec.clone().with_output(output);

        let mut handle = self.processes.spawn(&spec).await?;
        tracing::debug!(
            stage = %self.state.name(),
            process = %handle.identifier(),
            command = %spec,
            "launched"
        );

        let pumps: Vec<JoinHandle<()>> = [
            pump(handle.take_stdout(), log.clone(), LogStream::Stdout),
            pump(handle.take_stderr(), log.clone(), LogStream::Stderr),
        ]
        .into_iter()
        .flatten()
        .collect();

        let waited = tokio::select! {
            exit = handle.wait() => Some(exit),
            _ = cancel.cancelled() => None,
        };

        let Some(exit) = waited else {
            if let Err(e) = handle.kill().await {
                tracing::warn!(process = %handle.identifier(), error = %e, "failed to kill cancelled process");
            }
            for pump in &pumps {
                pump.abort();
            }
            return Err(StageError::Cancelled);
        };

        for pump in pumps {
            if let Err(e) = pump.await {
                tracing::warn!(error = %e, "output pump failed");
            }
        }
        self.check_exit(exit?)
    }

    fn check_exit(&self, exit: ProcessExit) -> Result<(), StageError> {
        if let Some(signal) = exit.signal {
            return Err(StageError::Signaled { signal });
        }
        if exit.success() || self.ignore_exit_status {
            return Ok(());
        }
        Err(StageError::ExitStatus {
            code: exit.code.unwrap_or(-1),
        })
    }
}

/// Forward each line of `reader` into the stage log from a background task.
fn pump(reader: Option<OutputReader>, log: StageLog, stream: LogStream) -> Option<JoinHandle<()>> {
    let reader = reader?;
    Some(tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(mut line)) => {
                    // Terminals translate newlines to CRLF.
                    if line.ends_with('\r') {
                        line.pop();
                    }
                    log.log(stream, line)
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(stream = %stream, error = %e, "failed to read process output");
                    break;
                }
            }
        }
    }))
}

#[async_trait]
impl<P: ProcessAdapter> Stage for LauncherStage<P> {
    fn state(&self) -> &StageState {
        &self.state
    }

    async fn execute(
        &self,
        _pipeline: &Pipeline,
        log: &StageLog,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        match &self.spec {
            Some(spec) => self.run(spec, log, cancel).await,
            None => Ok(()),
        }
    }

    async fn clean(
        &self,
        _pipeline: &Pipeline,
        log: &StageLog,
        cancel: &CancellationToken,
    ) -> Result<(), StageError> {
        match &self.clean_spec {
            Some(spec) => self.run(spec, log, cancel).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
#[path = "launcher_tests.rs"]
mod tests;
