use clap::{ArgAction, Parser};
use perfrec::{
    config::{ConfigErrors, LoaderConfig},
    database::{memory::MemoryBackend, sqlite::SqliteBackend, ConnectionAdapter},
    loader::{fs, LoadOptions, LoadSummary, MergeLoader},
    protocol::Vocabulary,
    ErrorKind, ReconcileError,
};
use std::{error::Error, path::PathBuf, process::ExitCode};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Merge perfrec logs into one database
#[derive(Parser, Debug)]
#[command(name = "perfrec-load", version)]
struct Args {
    /// Log files to merge, in the given order
    files: Vec<PathBuf>,

    /// YAML configuration, flags take precedence over it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database to merge into
    #[arg(long)]
    database: Option<PathBuf>,

    /// Vocabulary every log has to declare (character or full)
    #[arg(long)]
    format: Option<Vocabulary>,

    /// Discover logs with a glob, e.g. "run.*.log"
    #[arg(long)]
    glob: Option<String>,

    /// Rename every merged log with a "[done]_" prefix
    #[arg(long)]
    mark_done: bool,

    /// Merge into an in-memory store, nothing is persisted
    #[arg(long)]
    dry_run: bool,

    /// More output, repeat for trace level
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn diagnostic(error: &ReconcileError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }

    message
}

fn run(args: Args) -> Result<LoadSummary, ReconcileError> {
    let mut config = match args.config {
        Some(ref path) => LoaderConfig::load(path)?,
        None => LoaderConfig::default(),
    };

    if let Some(database) = args.database {
        config.database.path = database;
    }
    if args.format.is_some() {
        config.format = args.format;
    }
    if args.glob.is_some() {
        config.glob = args.glob;
    }
    config.mark_done |= args.mark_done;

    if config.preflight_checks(&args.files) {
        return Err(ConfigErrors::Preflight.into());
    }

    let mut files = args.files;
    if let Some(ref glob) = config.glob {
        let found = fs::discover(glob)?;
        if found.is_empty() {
            warn!(glob = %glob, "Glob matched no unmerged logs");
        }

        files.extend(found);
    }

    let backend = if args.dry_run {
        info!("Dry run, merging into memory");
        ConnectionAdapter::Memory(MemoryBackend::new())
    } else {
        ConnectionAdapter::SQLite(SqliteBackend::open(&config.database)?)
    };
    let options = LoadOptions {
        expected_format: config.format,
        mark_done: config.mark_done && !args.dry_run,
    };

    let mut loader = MergeLoader::new(backend, options);
    let result = loader.load_all(&files).map(Clone::clone);
    loader.summary().log();

    let closed = loader.into_backend().close();
    let summary = result?;
    closed?;

    Ok(summary)
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(_) => ExitCode::SUCCESS,
        Err(failure) => {
            let message = diagnostic(&failure);
            error!(kind = ?failure.kind(), "{message}");
            eprintln!("perfrec-load: {message}");

            match failure.kind() {
                ErrorKind::Config => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
