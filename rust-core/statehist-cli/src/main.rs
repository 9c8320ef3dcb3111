// SPDX-License-Identifier: PMPL-1.0-or-later
//!
//! shtinspect: inspect a sealed state history file.
//!
//! Subcommands:
//! - `info`: header summary (block size, node count, depth, time range)
//! - `tree`: pre-order dump of every node, optionally with its intervals
//! - `attributes`: the attribute tree, optionally filtered by a pattern
//! - `query`: the state of one or all attributes at a timestamp
//! - `range`: every interval of one attribute across a window
//! - `probe`: timed full-state queries with backend and cache counters

mod commands;
mod formatter;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use statehist_core::Timestamp;
use statehist_tree::ANY_PROVIDER_VERSION;

use commands::Inspector;
use formatter::OutputFormat;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ---------------------------------------------------------------------------
// CLI argument parsing
// ---------------------------------------------------------------------------

/// shtinspect: inspect state history files.
#[derive(Parser, Debug)]
#[command(name = "shtinspect", version = VERSION, about = "Inspect state history files")]
struct Cli {
    /// History file to open.
    file: PathBuf,

    /// Expected provider version. Any version is accepted when omitted.
    #[arg(long)]
    provider: Option<u32>,

    /// Output format: text or json.
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Header summary.
    Info,
    /// Dump the node structure.
    Tree {
        /// Also print each node's intervals.
        #[arg(long)]
        intervals: bool,
    },
    /// List attributes, optionally matching a pattern such as `CPUs/*/Status`.
    Attributes {
        #[arg(long)]
        pattern: Option<String>,
    },
    /// State at one timestamp.
    Query {
        #[arg(long, allow_hyphen_values = true)]
        time: Timestamp,
        /// Attribute path; all attributes when omitted.
        #[arg(long)]
        path: Option<String>,
    },
    /// Intervals of one attribute across a window.
    Range {
        #[arg(long)]
        path: String,
        #[arg(long, allow_hyphen_values = true)]
        from: Timestamp,
        #[arg(long, allow_hyphen_values = true)]
        to: Timestamp,
    },
    /// Time a batch of full-state queries.
    Probe {
        #[arg(long, default_value_t = 100)]
        samples: usize,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let inspector = Inspector::open(&cli.file, cli.provider.unwrap_or(ANY_PROVIDER_VERSION))?;
    let output = match &cli.command {
        Command::Info => inspector.info(cli.format)?,
        Command::Tree { intervals } => inspector.tree(*intervals)?,
        Command::Attributes { pattern } => inspector.attributes(pattern.as_deref(), cli.format)?,
        Command::Query { time, path } => inspector.query(*time, path.as_deref(), cli.format)?,
        Command::Range { path, from, to } => inspector.range(path, *from, *to, cli.format)?,
        Command::Probe { samples } => inspector.probe(*samples, cli.format)?,
    };
    print!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_query() {
        let cli = Cli::parse_from([
            "shtinspect",
            "--format",
            "json",
            "trace.ht",
            "query",
            "--time",
            "-5",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(cli.command, Command::Query { time: -5, path: None }));
    }
}
