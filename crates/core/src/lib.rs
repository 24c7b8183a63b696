// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! kiln-core: data model for the kiln build pipeline
//!
//! This crate provides:
//! - The `Phase` bit set and its ordering helpers
//! - Build configuration and the `kiln.toml` manifest
//! - Cancellation tokens, clocks and typed ids
//! - Value types shared with adapters (process specs, reap sets, log streams)

pub mod cancel;
pub mod clock;
pub mod config;
pub mod id;
pub mod log;
pub mod phase;
pub mod process;
pub mod reap;

pub use cancel::CancellationToken;
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{BuildManifest, ConfigError, Configuration, ErrorFormatDef, StageDef};
pub use id::{BindingId, ErrorFormatId, IdSeq, ObserverId};
pub use log::LogStream;
pub use phase::{Phase, PhaseError, Whence};
pub use process::{OutputMode, ProcessExit, ProcessSpec};
pub use reap::{ReapEntry, ReapKind, ReapSet};
