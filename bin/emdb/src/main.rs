//! Command-line host for the emdb email database.

#![warn(missing_debug_implementations, missing_docs, rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use emdb_engine::{CancelToken, EmailDatabase, EmailId};
use emdb_types::{CompressionAlgorithm, DatabaseOptions, EncryptionAlgorithm};
use std::path::PathBuf;
use tracing::{info, Level};

/// The emdb CLI application arguments.
#[derive(Debug, Parser)]
#[command(name = "emdb", about = "Embedded append-only email database", version)]
struct Cli {
    /// Verbosity level (0-4)
    #[arg(long, short, action = ArgAction::Count)]
    v: u8,
    /// Path to the database file.
    #[arg(long, short)]
    db: PathBuf,
    /// Master key as 64 hex characters; enables encrypted databases.
    #[arg(long, env = "EMDB_MASTER_KEY")]
    master_key: Option<String>,
    /// Default compression for new blocks.
    #[arg(long, default_value = "zstd")]
    compression: String,
    /// Default encryption for new blocks (requires --master-key).
    #[arg(long, default_value = "none")]
    encryption: String,
    /// Maintain the tamper-evidence hash chain.
    #[arg(long)]
    hash_chain: bool,
    /// Operation to run.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an empty database.
    Create,
    /// Import EML files.
    Import {
        /// Files to import.
        files: Vec<PathBuf>,
        /// Folder to file the imports into.
        #[arg(long)]
        folder: Option<String>,
    },
    /// Print one email as raw EML.
    Get {
        /// Compound id, `batch_id:local_id`.
        id: String,
    },
    /// Create a folder.
    CreateFolder {
        /// Folder path, `/`-separated for nesting.
        name: String,
    },
    /// List a folder's envelopes.
    List {
        /// Folder path.
        name: String,
    },
    /// Move an email between folders.
    Move {
        /// Compound id, `batch_id:local_id`.
        id: String,
        /// Source folder.
        from: String,
        /// Destination folder.
        to: String,
    },
    /// Search the corpus.
    Search {
        /// Query: terms, `field:value`, AND/OR/NOT, parentheses.
        query: String,
    },
    /// Print database statistics.
    Stats,
    /// Verify the hash chain.
    Verify,
    /// Rewrite the file, dropping superseded blocks.
    Compact,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing_subscriber(cli.v)?;

    let create = matches!(&cli.command, Command::Create);
    let options = DatabaseOptions {
        create_if_missing: create,
        master_key: cli.master_key.as_deref().map(parse_master_key).transpose()?,
        compression_default: parse_compression(&cli.compression)?,
        encryption_default: parse_encryption(&cli.encryption)?,
        hash_chain: cli.hash_chain,
        ..DatabaseOptions::create()
    };

    let mut db = EmailDatabase::open(&cli.db, options)
        .with_context(|| format!("opening database {}", cli.db.display()))?;

    match cli.command {
        Command::Create => {
            info!(target: "emdb::cli", path = %cli.db.display(), "database created");
        }
        Command::Import { files, folder } => {
            if files.is_empty() {
                bail!("no files to import");
            }
            if let Some(folder) = &folder {
                if !db.folders().contains(folder) {
                    db.create_folder(folder)?;
                }
            }
            let mut imported = Vec::new();
            let messages: Vec<(String, Vec<u8>)> = files
                .iter()
                .map(|path| {
                    Ok((
                        path.display().to_string(),
                        std::fs::read(path)
                            .with_context(|| format!("reading {}", path.display()))?,
                    ))
                })
                .collect::<Result<_>>()?;
            for (name, bytes) in messages {
                match db.import_eml(bytes, Some(&name)) {
                    Ok(id) => {
                        println!("{name}: {id}");
                        imported.push(id);
                    }
                    Err(e) => eprintln!("{name}: error: {e}"),
                }
            }
            db.flush()?;
            if let Some(folder) = folder {
                for id in imported {
                    db.add_to_folder(id, &folder)?;
                }
            }
        }
        Command::Get { id } => {
            let id: EmailId = id.parse().map_err(|e| anyhow!("{e}"))?;
            let email = db.get_email(id)?;
            std::io::Write::write_all(&mut std::io::stdout(), &email.raw)?;
        }
        Command::CreateFolder { name } => {
            db.create_folder(&name)?;
            println!("created {name}");
        }
        Command::List { name } => {
            for envelope in db.list_folder(&name)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    envelope.email_id, envelope.date, envelope.from, envelope.subject
                );
            }
        }
        Command::Move { id, from, to } => {
            let id: EmailId = id.parse().map_err(|e| anyhow!("{e}"))?;
            db.move_email(id, &from, &to)?;
            println!("moved {id} from {from} to {to}");
        }
        Command::Search { query } => {
            for hit in db.search(&query)? {
                println!(
                    "{:.3}\t{}\t{}\t[{}]",
                    hit.relevance,
                    hit.email_id,
                    hit.subject,
                    hit.matched_fields.join(",")
                );
            }
        }
        Command::Stats => {
            let stats = db.stats();
            println!("{}", serde_json::json!({
                "totalEmails": stats.total_emails,
                "storageBlocks": stats.storage_blocks,
                "searchIndexes": stats.search_indexes,
                "totalFolders": stats.total_folders,
                "totalBytes": stats.total_bytes,
                "supersededBlocks": stats.superseded_blocks,
            }));
        }
        Command::Verify => {
            let result = db.verify_hash_chain(None)?;
            if result.ok {
                println!("chain ok, {} entries checked", result.checked);
            } else {
                bail!(
                    "chain BROKEN at sequence {:?}: {}",
                    result.first_bad_sequence,
                    result.failure.unwrap_or_default()
                );
            }
        }
        Command::Compact => {
            let outcome = db.compact(&CancelToken::new())?;
            println!(
                "dropped {} blocks, {} -> {} bytes, backup at {}",
                outcome.blocks_dropped,
                outcome.bytes_before,
                outcome.bytes_after,
                outcome.backup.display()
            );
        }
    }

    db.close().map_err(|e| anyhow!("closing database: {e}"))?;
    Ok(())
}

fn parse_master_key(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).context("master key must be hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("master key must be exactly 32 bytes (64 hex characters)"))
}

fn parse_compression(name: &str) -> Result<CompressionAlgorithm> {
    Ok(match name.to_lowercase().as_str() {
        "none" => CompressionAlgorithm::None,
        "gzip" => CompressionAlgorithm::Gzip,
        "lz4" => CompressionAlgorithm::Lz4,
        "zstd" => CompressionAlgorithm::Zstd,
        "brotli" => CompressionAlgorithm::Brotli,
        other => bail!("unknown compression `{other}`"),
    })
}

fn parse_encryption(name: &str) -> Result<EncryptionAlgorithm> {
    Ok(match name.to_lowercase().as_str() {
        "none" => EncryptionAlgorithm::None,
        "aes-gcm" | "aes256-gcm" => EncryptionAlgorithm::Aes256Gcm,
        "chacha20" | "chacha20-poly1305" => EncryptionAlgorithm::ChaCha20Poly1305,
        "aes-cbc-hmac" | "aes256-cbc-hmac" => EncryptionAlgorithm::Aes256CbcHmac,
        other => bail!("unknown encryption `{other}`"),
    })
}

/// Initializes the tracing subscriber
///
/// # Arguments
/// * `verbosity_level` - The verbosity level (0-4)
///
/// # Returns
/// * `Result<()>` - Ok if successful, Err otherwise.
fn init_tracing_subscriber(verbosity_level: u8) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(match verbosity_level {
            0 => Level::ERROR,
            1 => Level::WARN,
            2 => Level::INFO,
            3 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|e| anyhow!(e))
}
