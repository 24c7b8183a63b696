// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! build, clean and rebuild

use crate::driver;
use anyhow::Result;
use clap::Args;
use kiln_core::Phase;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

/// Exit status after an interrupt, as a shell reports SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Args)]
pub struct PhaseArgs {
    /// Target phase (e.g. configure, build, install, build:after)
    #[arg(long, default_value = "build", value_parser = super::parse_phase)]
    pub phase: Phase,
}

#[derive(Debug, Clone, Copy)]
pub enum Operation {
    Build,
    Clean,
    Rebuild,
}

pub async fn run(op: Operation, args: PhaseArgs, manifest: &Path) -> Result<ExitCode> {
    let session = driver::open(manifest)?;
    let manager = Arc::clone(&session.manager);

    let interrupt = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted");
                manager.cancel();
            }
        }
    });

    let result = match op {
        Operation::Build => manager.execute(args.phase, None).await,
        Operation::Clean => manager.clean(args.phase, None).await,
        Operation::Rebuild => manager.rebuild(args.phase, None).await,
    };
    interrupt.abort();

    for diagnostic in session.take_diagnostics() {
        eprintln!("{}", diagnostic);
    }
    if let Some(summary) = driver::summary(&manager) {
        eprintln!("kiln: {}", summary);
    }
    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) if e.is_cancelled() => {
            eprintln!("kiln: cancelled");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(e) => {
            eprintln!("kiln: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}
