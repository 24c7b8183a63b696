// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! CLI command implementations

pub mod build;
pub mod stages;

use kiln_core::Phase;

/// Parse a phase argument such as `build`, `install` or `configure:after`.
fn parse_phase(s: &str) -> Result<Phase, String> {
    s.parse::<Phase>().map_err(|e| e.to_string())
}
