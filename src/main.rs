use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use packstash::repo::{EncryptedRepo, PlainRepo, Repository};
use packstash::save::{save_stream, SaveOptions};
use packstash::walk::walk_paths;
use packstash::{Config, Error};

#[derive(Parser)]
#[command(name = "packstash", version, about = "Deduplicating content-addressed backups")]
struct Cli {
    /// Repository root directory
    #[arg(short = 'r', long, default_value = ".")]
    repo: PathBuf,

    /// Passphrase for encrypted repositories (PACKSTASH_PASSPHRASE wins)
    #[arg(long, global = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a repository skeleton
    Init {
        /// Generate a keyfile and store only ciphertext
        #[arg(long)]
        encrypted: bool,
        /// Enable directory tree-split
        #[arg(long)]
        treesplit: bool,
        /// Route data and metadata into separate packs
        #[arg(long)]
        separatemeta: bool,
    },
    /// Save one or more paths as a new commit on a branch
    Save {
        /// Branch to advance
        #[arg(short, long)]
        name: String,
        /// Path prefix stripped from stored names
        #[arg(long)]
        strip: Option<PathBuf>,
        /// Commit timestamp as a UNIX epoch
        #[arg(long)]
        date: Option<i64>,
        /// Commit timestamp as an RFC 3339 date
        #[arg(short = 'd', long = "date-str")]
        date_str: Option<String>,
        #[arg(required = true, num_args = 1..)]
        paths: Vec<PathBuf>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Inaccessible { path, reason }) => {
            eprintln!("error: repository inaccessible at {}: {reason}", path.display());
            ExitCode::from(3)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn passphrase_for(cli_value: &Option<String>) -> Option<String> {
    std::env::var("PACKSTASH_PASSPHRASE")
        .ok()
        .or_else(|| cli_value.clone())
}

fn parse_when(date: Option<i64>, date_str: &Option<String>) -> Result<Option<DateTime<Utc>>, Error> {
    if let Some(epoch) = date {
        return Utc
            .timestamp_opt(epoch, 0)
            .single()
            .map(Some)
            .ok_or_else(|| Error::Input {
                path:   epoch.to_string().into(),
                reason: "epoch out of range".into(),
            });
    }
    if let Some(s) = date_str {
        return DateTime::parse_from_rfc3339(s)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|e| Error::Input { path: s.into(), reason: format!("bad date: {e}") });
    }
    Ok(None)
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Init { encrypted, treesplit, separatemeta } => {
            let config = Config {
                treesplit: *treesplit,
                separatemeta: *separatemeta,
                ..Config::default()
            };
            if *encrypted {
                let passphrase = passphrase_for(&cli.passphrase).ok_or_else(|| Error::Input {
                    path:   cli.repo.clone(),
                    reason: "encrypted init needs --passphrase or PACKSTASH_PASSPHRASE".into(),
                })?;
                EncryptedRepo::init(&cli.repo, &passphrase, config)?;
            } else {
                PlainRepo::init(&cli.repo, config)?;
            }
            println!("Initialized repository at {}", cli.repo.display());
            Ok(())
        }

        Commands::Save { name, strip, date, date_str, paths } => {
            let mut opts = SaveOptions::new(name.clone());
            opts.strip_prefix = strip.clone();
            opts.when = parse_when(*date, date_str)?;

            let commit_id = if cli.repo.join("keyfile").is_file() {
                let passphrase = passphrase_for(&cli.passphrase).ok_or_else(|| Error::Auth {
                    name: "keyfile (no passphrase given)".into(),
                })?;
                let mut repo = EncryptedRepo::open(&cli.repo, &passphrase)?;
                let commit = save_stream(&mut repo, walk_paths(paths), &opts)?;
                report(&repo.summary(), name, &commit);
                commit
            } else {
                let mut repo = PlainRepo::open(&cli.repo)?;
                let commit = save_stream(&mut repo, walk_paths(paths), &opts)?;
                report(&repo.summary(), name, &commit);
                commit
            };
            println!("{commit_id}");
            Ok(())
        }
    }
}

fn report(summary: &packstash::SaveSummary, branch: &str, commit: &packstash::ObjectId) {
    eprintln!(
        "saved {} -> {}: {} new object(s), {} B written, {} reused, {} pack(s)",
        branch,
        &commit.to_hex()[..12],
        summary.objects_written,
        summary.bytes_written,
        summary.objects_reused,
        summary.packs.len(),
    );
}
