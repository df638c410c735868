/*!
Tabpickle CLI - persist JSON-described value graphs as archives and restore
archives back to JSON.
*/

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tabpickle_core::{
    create_engine_from_config, json, CompressionOptions, Destination, EngineConfig, ErrorKind,
    Location, PersistError, PersistOptions, PickleEngine, RestoreOptions, Source, StorageOptions,
    StringDecoding,
};
use tracing::{debug, error};

#[derive(Parser)]
#[command(name = "tabpickle")]
#[command(about = "Persist and restore tabular object archives")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "TABPICKLE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Debug, Default)]
struct StreamArgs {
    /// Compression method, or "infer" to choose from the file suffix
    #[arg(short, long, default_value = "infer")]
    compression: CompressionOptions,

    /// Option passed to a URI storage backend, as key=value (repeatable)
    #[arg(long = "storage-option", value_parser = parse_key_val)]
    storage_options: Vec<(String, String)>,
}

impl StreamArgs {
    fn storage_options(&self) -> Option<StorageOptions> {
        if self.storage_options.is_empty() {
            None
        } else {
            Some(self.storage_options.iter().cloned().collect())
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write the value described by a JSON document to an archive
    Persist {
        /// JSON input file, or "-" for stdin
        input: String,
        /// Destination path or scheme://path, or "-" for stdout
        destination: String,
        /// Protocol version; negative selects the highest
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        protocol: i32,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Print the JSON rendering of an archive
    Restore {
        /// Source path or scheme://path, or "-" for stdin
        source: String,
        /// Legacy string decodings to try, in order (repeatable)
        #[arg(long = "decoding")]
        decodings: Vec<StringDecoding>,
        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
        #[command(flatten)]
        stream: StreamArgs,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("{}", describe_failure(&e));
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let engine = load_engine(cli.config.as_ref())?;
    match cli.command {
        Commands::Persist {
            input,
            destination,
            protocol,
            stream,
        } => {
            let document = read_input(&input)?;
            let options = PersistOptions {
                compression: stream.compression,
                protocol,
                storage_options: stream.storage_options(),
            };
            persist_document(&engine, &document, &destination, &options)
        }
        Commands::Restore {
            source,
            decodings,
            pretty,
            stream,
        } => {
            let options = RestoreOptions {
                compression: stream.compression,
                storage_options: stream.storage_options(),
                decodings,
            };
            let rendered = restore_document(&engine, &source, &options)?;
            let text = if pretty {
                serde_json::to_string_pretty(&rendered)?
            } else {
                serde_json::to_string(&rendered)?
            };
            println!("{text}");
            Ok(())
        }
    }
}

fn load_engine(config: Option<&PathBuf>) -> anyhow::Result<PickleEngine> {
    let config = match config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<EngineConfig>(&text)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => EngineConfig::default_local(),
    };
    debug!(?config, "Loaded engine configuration");
    Ok(create_engine_from_config(config)?)
}

fn read_input(input: &str) -> anyhow::Result<serde_json::Value> {
    let text = if input == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text)?;
        text
    } else {
        fs::read_to_string(input).with_context(|| format!("Failed to read {input}"))?
    };
    serde_json::from_str(&text).with_context(|| format!("{input} is not valid JSON"))
}

fn persist_document(
    engine: &PickleEngine,
    document: &serde_json::Value,
    destination: &str,
    options: &PersistOptions,
) -> anyhow::Result<()> {
    let value = json::from_json(document)?;
    if destination == "-" {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        engine.persist(&value, Destination::writer(&mut handle), options)?;
        handle.flush()?;
    } else {
        engine.persist(&value, Location::parse(destination)?, options)?;
    }
    Ok(())
}

fn restore_document(
    engine: &PickleEngine,
    source: &str,
    options: &RestoreOptions,
) -> anyhow::Result<serde_json::Value> {
    let value = if source == "-" {
        let stdin = io::stdin();
        let mut handle = stdin.lock();
        engine.restore(Source::reader(&mut handle), options)?
    } else {
        engine.restore(Location::parse(source)?, options)?
    };
    Ok(json::to_json(&value))
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

fn persist_error(e: &anyhow::Error) -> Option<&PersistError> {
    e.chain().find_map(|cause| cause.downcast_ref::<PersistError>())
}

/// Message telling an unsupported writer apart from a damaged file.
fn describe_failure(e: &anyhow::Error) -> String {
    match persist_error(e).map(PersistError::kind) {
        Some(ErrorKind::UnsupportedVersion) => {
            format!("✗ Archive was written by a newer, unsupported version: {e}")
        }
        Some(ErrorKind::UnresolvableSymbol) => {
            format!("✗ Archive was written by an unsupported version: {e}")
        }
        Some(ErrorKind::CorruptArchive | ErrorKind::Encoding) => format!("✗ Archive is corrupt: {e}"),
        Some(ErrorKind::StreamAcquisition) => format!("✗ Cannot open archive: {e}"),
        Some(_) => format!("✗ {e}"),
        None => format!("✗ {e:#}"),
    }
}

fn exit_code(e: &anyhow::Error) -> u8 {
    match persist_error(e).map(PersistError::kind) {
        Some(ErrorKind::UnsupportedVersion | ErrorKind::UnresolvableSymbol) => 3,
        Some(ErrorKind::CorruptArchive | ErrorKind::Encoding) => 4,
        _ => 1,
    }
}
