// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build file reaping adapters

mod fs;
mod noop;

pub use fs::FsReaper;
pub use noop::NoOpReaper;

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
mod fake;
#[cfg(any(test, feature = "test-support"))]
pub use fake::FakeReaperAdapter;

use async_trait::async_trait;
use kiln_core::ReapSet;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from reap operations
#[derive(Debug, Error)]
pub enum ReapError {
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Adapter that deletes files and directories before a rebuild
#[async_trait]
pub trait ReaperAdapter: Clone + Send + Sync + 'static {
    /// Delete every entry. Missing paths are not errors. Returns how many
    /// entries were actually removed.
    async fn reap(&self, set: &ReapSet) -> Result<usize, ReapError>;
}
