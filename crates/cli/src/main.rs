// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! kiln - phase-ordered build pipeline runner

mod commands;
mod driver;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{build, stages};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "kiln",
    version,
    about = "kiln runs a project's build stages in phase order"
)]
struct Cli {
    /// Build manifest
    #[arg(long, global = true, default_value = "kiln.toml")]
    manifest: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage up to a phase
    Build(build::PhaseArgs),
    /// Clean stages from a phase onwards
    Clean(build::PhaseArgs),
    /// Invalidate, reap and build again from a phase
    Rebuild(build::PhaseArgs),
    /// Show the stages the next build would run
    Stages(stages::StagesArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    setup_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build(args) => build::run(build::Operation::Build, args, &cli.manifest).await,
        Commands::Clean(args) => build::run(build::Operation::Clean, args, &cli.manifest).await,
        Commands::Rebuild(args) => build::run(build::Operation::Rebuild, args, &cli.manifest).await,
        Commands::Stages(args) => {
            stages::run(args, &cli.manifest)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Diagnostics for kiln itself, filtered by `KILN_LOG`. Build output does
/// not go through here.
fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
