// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for stages, pipelines and the build manager

use kiln_adapters::{ProcessError, ReapError};
use kiln_core::{BindingId, Phase};
use std::path::PathBuf;
use thiserror::Error;

/// Errors a stage reports from execute or clean
#[derive(Debug, Error)]
pub enum StageError {
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("process exited with status {code}")]
    ExitStatus { code: i32 },
    #[error("process terminated by signal {signal}")]
    Signaled { signal: i32 },
    #[error("cancelled")]
    Cancelled,
    #[error("unpause called on stage {stage} without a matching pause")]
    UnbalancedUnpause { stage: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }
}

/// Errors returned by pipeline operations
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is busy with another operation")]
    Busy,
    #[error("invalid phase {phase}: {reason}")]
    InvalidPhase { phase: Phase, reason: String },
    #[error("no stage binding with id {0}")]
    UnknownBinding(BindingId),
    #[error("stage {stage} failed: {source}")]
    StageFailed { stage: String, source: StageError },
    #[error("stage {stage} failed to clean: {source}")]
    CleanFailed { stage: String, source: StageError },
    #[error("operation cancelled")]
    Cancelled,
    #[error("reap failed: {0}")]
    Reap(#[from] ReapError),
    #[error("build directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid error format: {0}")]
    ErrorFormat(#[from] regex::Error),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    pub fn invalid_phase(phase: Phase, reason: impl std::fmt::Display) -> Self {
        PipelineError::InvalidPhase {
            phase,
            reason: reason.to_string(),
        }
    }
}

/// Errors returned by the build manager
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot execute pipeline, it has not yet been prepared")]
    NotReady,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("stage provider {provider} failed to load: {source}")]
    Provider {
        provider: String,
        source: PipelineError,
    },
}

impl ManagerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ManagerError::Pipeline(e) if e.is_cancelled())
    }
}
