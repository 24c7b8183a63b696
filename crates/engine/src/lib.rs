// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln build pipeline engine

pub mod diagnostics;
mod error;
mod launcher;
pub mod ledger;
pub mod log;
mod manager;
mod pipeline;
mod provider;
mod stage;

pub use diagnostics::{Diagnostic, DiagnosticExtractor, DiagnosticObserver, Severity};
pub use error::{ManagerError, PipelineError, StageError};
pub use launcher::LauncherStage;
pub use ledger::{PlanStep, StageBinding};
pub use log::{LogAggregator, LogObserver, LogWriter, DISPATCH_BATCH};
pub use manager::{BuildManager, DiagnosticCounts};
pub use pipeline::{Pipeline, PipelineState, PlannedStage};
pub use provider::{CommandsProvider, ManifestProvider, StageProvider};
pub use stage::{PauseHandle, Stage, StageLog, StageState};
