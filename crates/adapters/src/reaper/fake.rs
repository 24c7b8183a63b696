// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fake reaper for testing
#![cfg_attr(coverage_nightly, coverage(off))]

use super::{ReapError, ReaperAdapter};
use async_trait::async_trait;
use kiln_core::ReapSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Records every reap request without touching the filesystem
#[derive(Clone, Default)]
pub struct FakeReaperAdapter {
    reaped: Arc<Mutex<Vec<ReapSet>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl FakeReaperAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reap set received, in order
    pub fn calls(&self) -> Vec<ReapSet> {
        self.reaped.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// All paths across every reap request
    pub fn paths(&self) -> Vec<PathBuf> {
        self.calls()
            .iter()
            .flat_map(|set| set.iter().map(|e| e.path.clone()).collect::<Vec<_>>())
            .collect()
    }

    /// Make the next reaps fail with a permission error
    pub fn fail(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }
}

#[async_trait]
impl ReaperAdapter for FakeReaperAdapter {
    async fn reap(&self, set: &ReapSet) -> Result<usize, ReapError> {
        self.reaped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(set.clone());

        let failure = self.fail_with.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(message) = failure {
            let path = set.iter().next().map(|e| e.path.clone()).unwrap_or_default();
            return Err(ReapError::Remove {
                path,
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, message),
            });
        }
        Ok(set.len())
    }
}
