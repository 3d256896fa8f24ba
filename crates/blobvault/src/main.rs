//! `blobvault` operator CLI.
//!
//! Startup sequence:
//! 1. Parse the command line.
//! 2. Load and validate [`Config`] from `BLOBVAULT_*` environment variables.
//! 3. Initialise structured logging on stderr.
//! 4. Load KMS keys and open the store.
//! 5. Run the command.

mod telemetry;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use uuid::Uuid;

use blobvault::{Config, Content, EncryptedStorage, FsStore, Storage, StorageError};

const EXIT_CLI: u8 = 2;
const EXIT_FORMAT: u8 = 3;
const EXIT_IO: u8 = 4;
const EXIT_CRYPTO: u8 = 5;

#[derive(Parser, Debug)]
#[command(name = "blobvault", version, about = "Encrypted blob store tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a document and store it; prints the stored name
    Put {
        name: String,
        /// Read from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
        /// Bind the blob to this identifier instead of its name
        #[arg(long)]
        stable_id: Option<Uuid>,
    },
    /// Write the plaintext of a stored blob
    Cat {
        name: String,
        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the plaintext size without decrypting
    Size { name: String },
    /// Print header facts as JSON
    Inspect { name: String },
    /// Rewrite a blob as EG2 under the active key; prints the new name
    Reencrypt {
        name: String,
        #[arg(long)]
        stable_id: Option<Uuid>,
        /// Delete the source blob once the new one is stored
        #[arg(long)]
        remove_source: bool,
    },
}

fn main() -> ExitCode {
    // -----------------------------------------------------------------------
    // 1. Command line
    // -----------------------------------------------------------------------
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if e.print().is_err() {
                eprintln!("{e}");
            }
            return if e.use_stderr() {
                ExitCode::from(EXIT_CLI)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging is not up yet; write to stderr directly.
            eprintln!("ERROR: configuration invalid: {e:#}");
            return ExitCode::from(EXIT_CLI);
        }
    };

    // -----------------------------------------------------------------------
    // 3. Telemetry
    // -----------------------------------------------------------------------
    if let Err(e) = telemetry::init(&cfg.log_level) {
        eprintln!("ERROR: {e:#}");
        return ExitCode::from(EXIT_CLI);
    }
    info!(version = env!("CARGO_PKG_VERSION"), "blobvault starting");

    // -----------------------------------------------------------------------
    // 4. Store + 5. Command
    // -----------------------------------------------------------------------
    let result =
        EncryptedStorage::from_config(&cfg).and_then(|storage| run(&storage, cli.command));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("ERROR: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn run(storage: &EncryptedStorage<FsStore>, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            name,
            input,
            stable_id,
        } => {
            let mut source: Box<dyn Read> = match &input {
                Some(path) => Box::new(
                    File::open(path).with_context(|| format!("opening {}", path.display()))?,
                ),
                None => Box::new(io::stdin().lock()),
            };
            let mut content = Content::new(source.as_mut());
            if let Some(id) = stable_id {
                content = content.with_stable_id(id);
            }
            println!("{}", storage.save(&name, content)?);
        }
        Commands::Cat { name, output } => {
            let mut plaintext = storage.open(&name)?;
            match output {
                Some(path) => {
                    let mut file = File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    io::copy(&mut plaintext, &mut file)?;
                    file.sync_all()?;
                }
                None => {
                    let mut stdout = io::stdout().lock();
                    io::copy(&mut plaintext, &mut stdout)?;
                    stdout.flush()?;
                }
            }
        }
        Commands::Size { name } => println!("{}", storage.size(&name)?),
        Commands::Inspect { name } => {
            let info = storage.inspect(&name)?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Reencrypt {
            name,
            stable_id,
            remove_source,
        } => {
            let stored = storage.reencrypt(&name, stable_id)?;
            if remove_source && stored != name {
                storage.remove(&name)?;
            }
            println!("{stored}");
        }
    }
    Ok(())
}

fn exit_code(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<StorageError>() {
        Some(StorageError::Validation(_) | StorageError::UnknownFormat(_)) => EXIT_FORMAT,
        Some(StorageError::AuthenticationFailure(_) | StorageError::KeyResolution(_)) => {
            EXIT_CRYPTO
        }
        Some(StorageError::Io(_)) => EXIT_IO,
        None if e.downcast_ref::<io::Error>().is_some() => EXIT_IO,
        None => EXIT_CLI,
    }
}
