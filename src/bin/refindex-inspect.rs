//! Diagnostics for an index file.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use refindex::storage::{PagedStorage, StorageStats};
use refindex::{IndexOptions, SourceFile};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "refindex-inspect",
    version,
    about = "Inspect a refindex index file",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_name = "DB", help = "Index file to inspect")]
    db_path: PathBuf,

    #[arg(long, value_name = "FILE", env = "REFINDEX_CONFIG", help = "TOML options file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every record grouped by location.
    Dump,
    /// List indexed files with their modification stamps.
    Files,
    /// List files indexed with errors.
    Errors,
    /// Show page and cache counters.
    Stats,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("REFINDEX_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let options = match &cli.config {
        Some(path) => IndexOptions::load(path)?,
        None => IndexOptions::default(),
    };
    let mut storage = PagedStorage::open(&cli.db_path, &options.pager_options(), None)?;
    match cli.command {
        Command::Dump => {
            let dump = storage.dump(None)?;
            match cli.format {
                OutputFormat::Text => print!("{dump}"),
                OutputFormat::Json => {
                    let lines: Vec<&str> = dump.lines().collect();
                    println!("{}", serde_json::to_string_pretty(&lines)?);
                }
            }
        }
        Command::Files => emit_files(cli.format, &storage.all_files()?)?,
        Command::Errors => emit_files(cli.format, &storage.files_with_errors()?)?,
        Command::Stats => {
            let stats = storage.stats()?;
            match cli.format {
                OutputFormat::Text => print_stats_text(&stats),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
        }
    }
    Ok(())
}

fn emit_files(format: OutputFormat, files: &[SourceFile]) -> Result<(), Box<dyn Error>> {
    match format {
        OutputFormat::Text => {
            for file in files {
                println!("{}\t{}", file.modification_stamp, file.path);
            }
        }
        OutputFormat::Json => {
            let value: Vec<serde_json::Value> = files
                .iter()
                .map(|file| {
                    serde_json::json!({
                        "path": file.path,
                        "modification_stamp": file.modification_stamp,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }
    Ok(())
}

fn print_stats_text(stats: &StorageStats) {
    print_field("page size", stats.page_size);
    print_field("allocated pages", stats.allocated_pages);
    print_field("free pages", stats.free_pages);
    print_field("layers", stats.layer_count);
    print_field("locations", stats.locations);
    print_field("dictionary pages", stats.dictionary_pages);
    print_field("directory pages", stats.directory_pages);
    print_field("last lsn", stats.last_lsn);
    print_field("recovered frames", stats.pager.recovered_frames);
    print_field("pages read", stats.pager.pages_read);
    print_field("cache hits", stats.pager.cache.hits);
    print_field("cache misses", stats.pager.cache.misses);
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {name:.<24} {value}");
}
