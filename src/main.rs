//! boardfs - staged root filesystem builder for embedded boards.
//!
//! Bootstraps a Debian-family rootfs, configures it for the board and packs
//! it into a tarball. Each stage is stamped; re-running a build skips every
//! stage whose inputs haven't changed.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "boardfs")]
#[command(about = "Staged rootfs image builder for embedded Linux boards")]
#[command(
    after_help = "QUICK START:\n  boardfs preflight          Check host tools\n  boardfs build              Build every stage\n  boardfs build configure    Stop after configure\n  boardfs status             Show which stages are cached"
)]
struct Cli {
    /// Build configuration file
    #[arg(short, long, global = true, default_value = "board.json")]
    config: PathBuf,

    /// Output directory (working tree, archives, stamps)
    #[arg(short, long, global = true, default_value = "output")]
    output: PathBuf,

    /// Debug logging (skip decisions, every command and rollback action)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline up to and including STAGE (default: all stages)
    Build {
        stage: Option<String>,

        /// Re-run a stage even if its stamp is valid (repeatable)
        #[arg(long, value_name = "STAGE")]
        force: Vec<String>,
    },

    /// Show which stages are cached and which would run
    Status,

    /// Remove build state (default: stamps only)
    Clean {
        #[command(subcommand)]
        what: Option<CleanTarget>,
    },

    /// Run preflight checks (host tools, privileges)
    Preflight {
        /// Exit with an error if any check fails
        #[arg(long)]
        strict: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },
}

#[derive(Subcommand)]
enum CleanTarget {
    /// Remove stamps so the next build runs every stage
    Stamps,
    /// Remove the whole output directory
    All,
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show the resolved configuration
    Config,
    /// List the stages of the configured variant
    Stages,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    match cli.command {
        Commands::Build { stage, force } => {
            commands::cmd_build(commands::build::BuildArgs {
                config: cli.config,
                output: cli.output,
                stage,
                force,
            })?;
        }

        Commands::Status => {
            commands::cmd_status(&cli.config, &cli.output)?;
        }

        Commands::Clean { what } => {
            let clean_target = match what {
                None | Some(CleanTarget::Stamps) => commands::clean::CleanTarget::Stamps,
                Some(CleanTarget::All) => commands::clean::CleanTarget::All,
            };
            commands::cmd_clean(&cli.output, clean_target)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&cli.output, strict)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Stages => commands::show::ShowTarget::Stages,
            };
            commands::cmd_show(&cli.config, &cli.output, show_target)?;
        }
    }

    Ok(())
}
