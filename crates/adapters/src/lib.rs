// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
// Enable coverage(off) attribute for excluding test infrastructure
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Adapters for external I/O: child processes and build file reaping

pub mod process;
pub mod reaper;
pub mod traced;

pub use process::{NativeProcessAdapter, OutputReader, ProcessAdapter, ProcessError, ProcessHandle};
pub use reaper::{FsReaper, NoOpReaper, ReapError, ReaperAdapter};
pub use traced::{TracedProcessAdapter, TracedReaperAdapter};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
pub use process::{FakeProcessAdapter, FakeProcessScript, ProcessCall};
#[cfg(any(test, feature = "test-support"))]
pub use reaper::FakeReaperAdapter;
