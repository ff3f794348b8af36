//! CLI front door: argument parsing and subcommand dispatch.
//!
//! Every subcommand builds a [`CoverageModel`] against a per-invocation
//! cache, runs one query, and prints either JSON (always for per-file
//! queries, opt-in for `list`) or the box-drawing table. Errors print a
//! user-facing message to stderr and map to stable exit codes: usage 2,
//! resolution 3, staleness 4, everything else 1.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::cache::CoverageDataCache;
use crate::error::CovError;
use crate::model::{CoverageModel, ModelOptions, SortOrder};
use crate::output;
use crate::staleness::StalenessMode;

// ============================================================================
// Arguments
// ============================================================================

/// Coverage loupe: query, staleness-check, and serve test-run line coverage.
#[derive(Parser)]
#[command(name = "covscope")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Project root directory (default: current directory)
    #[arg(long, short = 'R', global = true)]
    root: Option<PathBuf>,

    /// Resultset file or a directory containing .resultset.json
    #[arg(long, short = 'r', global = true)]
    resultset: Option<PathBuf>,

    /// Staleness enforcement: off or error
    #[arg(long, global = true, default_value = "off")]
    stale: String,

    /// Glob patterns scoping which files are expected to have coverage
    #[arg(long = "tracked-globs", short = 'g', global = true, value_delimiter = ',')]
    tracked_globs: Vec<String>,

    /// Listing order: ascending or descending (by percentage)
    #[arg(long = "sort-order", short = 'o', global = true, default_value = "descending")]
    sort_order: String,

    /// Emit JSON instead of the table for listing output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show per-file coverage for the whole project (default)
    List,

    /// Covered/total/percentage for one file
    Summary {
        /// Source file, relative to the root or absolute
        path: String,
    },

    /// Raw per-line hit counts for one file
    Raw {
        /// Source file, relative to the root or absolute
        path: String,
    },

    /// Uncovered line numbers for one file
    Uncovered {
        /// Source file, relative to the root or absolute
        path: String,
    },

    /// Detailed per-line rows for one file
    Detailed {
        /// Source file, relative to the root or absolute
        path: String,
    },

    /// Project-wide totals across files with trustworthy coverage
    Totals,

    /// Check that coverage still describes the source tree (exit 4 if not)
    Validate,

    /// Print version information
    Version,

    /// Run the MCP server on stdio
    #[cfg(feature = "mcp")]
    Mcp,
}

// ============================================================================
// Dispatch
// ============================================================================

/// Parse arguments and run; the binary's whole body.
pub fn run() -> ExitCode {
    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.user_message());
            ExitCode::from(e.exit_code())
        }
    }
}

fn execute(cli: Cli) -> Result<(), CovError> {
    let staleness_mode: StalenessMode = cli.stale.parse()?;
    let sort_order: SortOrder = cli.sort_order.parse()?;

    let options = ModelOptions {
        root: cli.root.clone(),
        resultset: cli.resultset.clone(),
        staleness_mode,
        tracked_globs: cli.tracked_globs.clone(),
    };

    match cli.command.unwrap_or(Commands::List) {
        Commands::List => {
            let model = build_model(&options)?;
            let listing = model.list(sort_order)?;
            if cli.json {
                print_json(&model.relativize(&listing)?);
            } else {
                let relativizer = model.relativizer();
                let rows: Vec<output::FileRow> = listing
                    .files
                    .iter()
                    .map(|row| output::FileRow {
                        file: relativizer.relativize_path(&row.file),
                        ..row.clone()
                    })
                    .collect();
                println!("{}", output::format_table(&rows));
            }
            Ok(())
        }
        Commands::Summary { path } => {
            let model = build_model(&options)?;
            print_json(&model.relativize(&model.summary_for(&path)?)?);
            Ok(())
        }
        Commands::Raw { path } => {
            let model = build_model(&options)?;
            print_json(&model.relativize(&model.raw_for(&path)?)?);
            Ok(())
        }
        Commands::Uncovered { path } => {
            let model = build_model(&options)?;
            print_json(&model.relativize(&model.uncovered_for(&path)?)?);
            Ok(())
        }
        Commands::Detailed { path } => {
            let model = build_model(&options)?;
            print_json(&model.relativize(&model.detailed_for(&path)?)?);
            Ok(())
        }
        Commands::Totals => {
            let model = build_model(&options)?;
            print_json(&model.relativize(&model.project_totals()?)?);
            Ok(())
        }
        Commands::Validate => {
            let model = build_model(&options)?;
            model.validate()?;
            print_json(&serde_json::json!({ "status": "ok" }));
            Ok(())
        }
        Commands::Version => {
            print_json(&serde_json::json!({
                "name": "covscope",
                "version": env!("CARGO_PKG_VERSION"),
            }));
            Ok(())
        }
        #[cfg(feature = "mcp")]
        Commands::Mcp => {
            let runtime = tokio::runtime::Runtime::new()
                .map_err(|e| CovError::Internal(format!("failed to start runtime: {e}")))?;
            runtime.block_on(crate::mcp::run_mcp_server())
        }
    }
}

fn build_model(options: &ModelOptions) -> Result<CoverageModel, CovError> {
    // One cache per invocation: within a single CLI run every query shares
    // loaded data; persistence across runs is explicitly a non-goal.
    let cache = CoverageDataCache::new();
    CoverageModel::new(&cache, options)
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("failed to serialize output: {e}"),
    }
}

// ============================================================================
// Tests
// ============================================================================
