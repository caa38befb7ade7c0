//! nexus-blob command-line tool
//!
//! Administers a BLOB engine data directory: stores and reads BLOBs, edits
//! references and metadata, inspects repositories, and runs compaction,
//! backup and restore.
//!
//! # Usage
//!
//! ```bash
//! # Store a file referenced from row 42 of table "photos"
//! nexus-blob --data-dir /srv/blobs put media photos cat.jpg --row 42
//!
//! # Read it back
//! nexus-blob --data-dir /srv/blobs get media '~*1~1-0-9f3a21c4-51234' -o cat.jpg
//!
//! # Repository usage as JSON
//! nexus-blob -o json repos media
//!
//! # Back up and restore
//! nexus-blob backup media /backups/media-1
//! nexus-blob restore media-copy /backups/media-1
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod formatter;

use commands::{Command, Output};
use config::CliConfig;
use formatter::{format_report, OutputFormat};
use nexus_blob::BlobEngine;

/// nexus-blob command-line interface
#[derive(Parser, Debug)]
#[command(
    name = "nexus-blob",
    version,
    about = "Administer a nexus BLOB repository",
    long_about = "Administer a nexus BLOB repository.\n\n\
                  Use this tool to store and read BLOBs, manage their references and\n\
                  metadata, and run compaction, backup and restore on a data directory."
)]
struct Args {
    /// Data directory (overrides the config file)
    #[arg(short = 'D', long, env = "NEXUS_BLOB_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "NEXUS_BLOB_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output format (overrides the config file)
    #[arg(short = 'o', long, value_enum)]
    output: Option<OutputFormatArg>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "warn", value_name = "LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

/// Output format argument
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormatArg {
    /// Display results in a formatted table
    Table,
    /// Display results as JSON
    Json,
    /// Display results as CSV
    Csv,
    /// Display raw values
    Raw,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
            OutputFormatArg::Csv => OutputFormat::Csv,
            OutputFormatArg::Raw => OutputFormat::Raw,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config = load_config(&args)?;
    let format = match args.output {
        Some(arg) => arg.into(),
        None => OutputFormat::from_name(&config.output_format)
            .ok_or_else(|| anyhow!("unknown output format {:?}", config.output_format))?,
    };

    debug!(data_dir = %config.engine.data_dir.display(), "opening engine");
    let engine = BlobEngine::init(config.engine)?;
    let output = args.command.execute(&engine);
    engine.shutdown()?;

    match output? {
        Output::Report(report) => print!("{}", with_newline(format_report(&report, format))),
        Output::Message(message) => println!("{message}"),
        Output::Nothing => {}
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "nexus_cli={level},nexus_blob={level},nexus_templog={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<CliConfig> {
    let mut config = match &args.config {
        Some(path) => CliConfig::from_file(path)?,
        None => CliConfig::load_default()?,
    };

    if let Some(dir) = &args.data_dir {
        config.engine.data_dir = dir.clone();
    }

    Ok(config)
}

fn with_newline(mut text: String) -> String {
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "nexus-blob",
            "--data-dir",
            "/tmp/blobs",
            "-o",
            "json",
            "stats",
            "media",
        ])
        .unwrap();
        assert_eq!(args.data_dir, Some(PathBuf::from("/tmp/blobs")));
        assert!(matches!(args.output, Some(OutputFormatArg::Json)));
        assert!(matches!(args.command, Command::Stats { ref db } if db == "media"));
    }

    #[test]
    fn test_data_dir_overrides_config() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[engine]\ndata_dir = \"/from/file\"\n").unwrap();

        let args = Args::try_parse_from([
            "nexus-blob",
            "--config",
            path.to_str().unwrap(),
            "--data-dir",
            "/from/flag",
            "databases",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.engine.data_dir, PathBuf::from("/from/flag"));
    }

    #[test]
    fn test_with_newline() {
        assert_eq!(with_newline("a".into()), "a\n");
        assert_eq!(with_newline("a\n".into()), "a\n");
    }
}
