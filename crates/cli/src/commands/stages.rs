// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `kiln stages` - list the stages a build would run

use crate::driver;
use crate::output::{print_list, OutputFormat};
use anyhow::Result;
use clap::Args;
use kiln_core::Phase;
use kiln_engine::PlannedStage;
use serde::Serialize;
use std::path::Path;

#[derive(Args)]
pub struct StagesArgs {
    /// Plan up to this phase
    #[arg(long, default_value = "build", value_parser = super::parse_phase)]
    pub phase: Phase,

    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Debug, Serialize)]
pub struct StageInfo {
    pub name: String,
    pub phase: String,
    pub priority: i32,
    pub completed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chained: Vec<String>,
}

impl From<PlannedStage> for StageInfo {
    fn from(stage: PlannedStage) -> Self {
        Self {
            name: stage.name,
            phase: stage.phase.to_string(),
            priority: stage.priority,
            completed: stage.completed,
            chained: stage.chained,
        }
    }
}

impl std::fmt::Display for StageInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = if self.completed { "done" } else { "-" };
        write!(f, "{:<20} {:>4}  {:<4}  {}", self.phase, self.priority, mark, self.name)?;
        if !self.chained.is_empty() {
            write!(f, " (+ {})", self.chained.join(", "))?;
        }
        Ok(())
    }
}

pub fn run(args: StagesArgs, manifest: &Path) -> Result<()> {
    let session = driver::open(manifest)?;
    let stages: Vec<StageInfo> = session
        .pipeline
        .plan(args.phase)
        .into_iter()
        .map(StageInfo::from)
        .collect();

    if stages.is_empty() && matches!(args.format, OutputFormat::Text) {
        println!("No stages up to {}", args.phase);
        return Ok(());
    }
    print_list(&stages, args.format);
    Ok(())
}
