// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! No-op reaper for dry runs.

use super::{ReapError, ReaperAdapter};
use async_trait::async_trait;
use kiln_core::ReapSet;

/// Reaper that logs what it would delete and deletes nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpReaper;

impl NoOpReaper {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReaperAdapter for NoOpReaper {
    async fn reap(&self, set: &ReapSet) -> Result<usize, ReapError> {
        for entry in set.iter() {
            tracing::debug!(path = %entry.path.display(), kind = ?entry.kind, "would reap");
        }
        Ok(0)
    }
}
