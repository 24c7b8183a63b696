// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake process adapter for testing
#![cfg_attr(coverage_nightly, coverage(off))]

use super::{OutputReader, ProcessAdapter, ProcessError, ProcessHandle};
use async_trait::async_trait;
use kiln_core::{OutputMode, ProcessExit, ProcessSpec};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

/// Recorded process call
#[derive(Debug, Clone)]
pub enum ProcessCall {
    Spawn { id: String, spec: ProcessSpec },
    Kill { id: String },
}

/// Scripted behavior for one program
#[derive(Debug, Clone)]
pub struct FakeProcessScript {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit: ProcessExit,
    /// Never exit on its own; only `kill` ends the process
    pub hang: bool,
    pub spawn_error: Option<String>,
}

impl Default for FakeProcessScript {
    fn default() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit: ProcessExit::code(0),
            hang: false,
            spawn_error: None,
        }
    }
}

impl FakeProcessScript {
    pub fn exit_code(code: i32) -> Self {
        Self {
            exit: ProcessExit::code(code),
            ..Self::default()
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            exit: ProcessExit::signaled(signal),
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn with_stdout(mut self, lines: &[&str]) -> Self {
        self.stdout = lines.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_stderr(mut self, lines: &[&str]) -> Self {
        self.stderr = lines.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Default)]
struct FakeState {
    scripts: HashMap<String, FakeProcessScript>,
    calls: Vec<ProcessCall>,
    next_id: u64,
}

/// Fake process adapter for testing
///
/// Scripts are looked up by the last argument (the shell command for
/// `/bin/sh -c` specs), then by the program. Unscripted programs succeed
/// silently.
#[derive(Clone, Default)]
pub struct FakeProcessAdapter {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcessAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior of a program or shell command
    pub fn script(&self, key: impl Into<String>, script: FakeProcessScript) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scripts
            .insert(key.into(), script);
    }

    /// Get all recorded calls
    pub fn calls(&self) -> Vec<ProcessCall> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).calls.clone()
    }

    /// Specs of every spawned process, in order
    pub fn spawned(&self) -> Vec<ProcessSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ProcessCall::Spawn { spec, .. } => Some(spec),
                ProcessCall::Kill { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl ProcessAdapter for FakeProcessAdapter {
    async fn spawn(&self, spec: &ProcessSpec) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        if spec.argv.is_empty() {
            return Err(ProcessError::EmptyArgv);
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.calls.push(ProcessCall::Spawn {
            id: id.clone(),
            spec: spec.clone(),
        });

        let script = spec
            .argv
            .last()
            .and_then(|last| state.scripts.get(last))
            .or_else(|| spec.program().and_then(|p| state.scripts.get(p)))
            .cloned()
            .unwrap_or_default();

        if let Some(err) = script.spawn_error {
            return Err(ProcessError::SpawnFailed(err));
        }

        let (stdout, stderr) = match spec.output {
            OutputMode::Piped => (join_lines(&script.stdout), Some(join_lines(&script.stderr))),
            OutputMode::Pty => {
                let merged: Vec<String> = script.stdout.iter().chain(&script.stderr).cloned().collect();
                (join_lines(&merged), None)
            }
        };
        Ok(Box::new(FakeProcess {
            id,
            stdout: Some(stdout),
            stderr,
            exit: script.exit,
            hang: script.hang,
            killed: false,
            state: Arc::clone(&self.state),
        }))
    }
}

fn join_lines(lines: &[String]) -> Vec<u8> {
    lines.iter().flat_map(|l| format!("{}\n", l).into_bytes()).collect()
}

struct FakeProcess {
    id: String,
    stdout: Option<Vec<u8>>,
    stderr: Option<Vec<u8>>,
    exit: ProcessExit,
    hang: bool,
    killed: bool,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn take_stdout(&mut self) -> Option<OutputReader> {
        let bytes = self.stdout.take()?;
        Some(Box::new(Cursor::new(bytes)))
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        let bytes = self.stderr.take()?;
        Some(Box::new(Cursor::new(bytes)))
    }

    async fn wait(&mut self) -> Result<ProcessExit, ProcessError> {
        if self.killed {
            return Ok(ProcessExit::signaled(9));
        }
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.exit)
    }

    async fn kill(&mut self) -> Result<(), ProcessError> {
        self.killed = true;
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calls
            .push(ProcessCall::Kill {
                id: self.id.clone(),
            });
        Ok(())
    }
}

#[cfg(test)]
#[path = "fake_tests.rs"]
mod tests;
