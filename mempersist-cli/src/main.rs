/*!
mempersist CLI - operator tooling for mempool files.

Inspects, verifies and cleans up the file a node writes on shutdown or on
`dumpmempool`, without starting the node.
*/

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use mempersist_core::codec::{self, to_hex};
use mempersist_core::observability::init_observability_with_filter;
use mempersist_core::storage::local::temp_path_for;
use mempersist_core::{
    AtomicFileWriter, FormatError, PersistConfig, Snapshot, StorageAdapter, TransactionRecord,
};
use serde_json::json;
use tabled::{Table, Tabled};
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "mempersist")]
#[command(about = "Inspect and maintain mempool persistence files")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Node data directory holding the mempool file
    #[arg(short, long, global = true, env = "MEMPERSIST_DATADIR")]
    datadir: Option<PathBuf>,

    /// Explicit mempool file, overriding the data directory
    #[arg(short, long, global = true)]
    file: Option<PathBuf>,

    /// JSON configuration file
    #[arg(short, long, global = true, env = "MEMPERSIST_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured persist_mempool setting
    #[arg(long, global = true, value_name = "BOOL")]
    persistmempool: Option<bool>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode the mempool file and list its transactions
    Inspect {
        /// Print machine-readable JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Check that the mempool file decodes cleanly
    Verify,
    /// Remove a leftover `<file>.new` from an interrupted dump
    CleanTemp,
}

#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "#")]
    position: usize,
    #[tabled(rename = "TxID")]
    txid: String,
    #[tabled(rename = "Arrived")]
    arrived: String,
    #[tabled(rename = "Fee rate")]
    fee_rate: u64,
    #[tabled(rename = "Size")]
    size: u32,
    #[tabled(rename = "Delta")]
    fee_delta: i64,
    #[tabled(rename = "Anc/Desc")]
    family: String,
    #[tabled(rename = "Parents")]
    parents: String,
}

impl RecordRow {
    fn new(position: usize, record: &TransactionRecord) -> Self {
        let meta = &record.meta;
        Self {
            position,
            txid: short_hash(&meta.txid.to_string()),
            arrived: meta.entry_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            fee_rate: meta.fee_rate,
            size: meta.size,
            fee_delta: meta.fee_delta,
            family: format!("{}/{}", meta.ancestor_count, meta.descendant_count),
            parents: meta
                .parents
                .iter()
                .map(|p| short_hash(&p.to_string()))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "mempersist=debug"
    } else {
        "mempersist=info"
    };
    init_observability_with_filter(cli.json_logs, filter)?;

    let config = resolve_config(&cli)?;
    let path = cli.file.clone().unwrap_or_else(|| config.mempool_path());
    debug!(
        "Using mempool file {} (persist_mempool={})",
        path.display(),
        config.persist_mempool
    );

    match cli.command {
        Commands::Inspect { json } => inspect(&path, json)?,
        Commands::Verify => verify(&path, &config)?,
        Commands::CleanTemp => clean_temp(&path)?,
    }

    Ok(())
}

/// Configuration file first, then command-line overrides
fn resolve_config(cli: &Cli) -> Result<PersistConfig, anyhow::Error> {
    let mut config = match &cli.config {
        Some(path) => PersistConfig::from_json_file(path)?,
        None => PersistConfig::new(PathBuf::from(".")),
    };
    if let Some(datadir) = &cli.datadir {
        config.data_dir = datadir.clone();
    }
    if let Some(enabled) = cli.persistmempool {
        config.persist_mempool = enabled;
    }
    config.validate()?;
    Ok(config)
}

fn read_snapshot(path: &Path) -> Result<(Snapshot, usize, u8), anyhow::Error> {
    let data = AtomicFileWriter::new().read(path)?;
    let header = codec::decode_header(&data)?;
    let snapshot = codec::decode(&data)?;
    Ok((snapshot, data.len(), header.compression))
}

fn inspect(path: &Path, as_json: bool) -> Result<(), anyhow::Error> {
    info!("Inspecting mempool file: {}", path.display());
    let (snapshot, file_size, compression) = read_snapshot(path)?;

    if as_json {
        let records: Vec<_> = snapshot
            .records
            .iter()
            .map(|record| {
                let meta = &record.meta;
                json!({
                    "txid": meta.txid.to_string(),
                    "entry_time": meta.entry_time.timestamp(),
                    "fee_rate": meta.fee_rate,
                    "size": meta.size,
                    "fee_delta": meta.fee_delta,
                    "ancestor_count": meta.ancestor_count,
                    "descendant_count": meta.descendant_count,
                    "parents": meta.parents.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
                    "payload": to_hex(&record.payload),
                })
            })
            .collect();
        let fee_deltas: serde_json::Map<String, serde_json::Value> = snapshot
            .fee_deltas
            .iter()
            .map(|(txid, delta)| (txid.to_string(), json!(delta)))
            .collect();

        let report = json!({
            "path": path.display().to_string(),
            "version": snapshot.version,
            "compression": compression,
            "file_size": file_size,
            "tip": snapshot.state.tip.to_string(),
            "height": snapshot.state.height,
            "captured_at": snapshot.captured_at.to_rfc3339(),
            "transactions": records,
            "fee_deltas": fee_deltas,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Mempool File:");
    println!("  Path: {}", path.display());
    println!("  Format Version: {}", snapshot.version);
    println!("  Compression: {}", compression_name(compression));
    println!("  Size: {}", format_size(file_size as u64));
    println!("  Captured: {}", snapshot.captured_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Chain Tip: {} (height {})", snapshot.state.tip, snapshot.state.height);
    println!("  Transactions: {}", snapshot.len());
    println!("  Detached Fee Deltas: {}", snapshot.fee_deltas.len());

    if snapshot.is_empty() {
        println!("No transactions in file");
    } else {
        let rows: Vec<RecordRow> = snapshot
            .records
            .iter()
            .enumerate()
            .map(|(i, record)| RecordRow::new(i, record))
            .collect();
        println!("{}", Table::new(rows));
    }

    Ok(())
}

/// What a node with this configuration would do with the file at startup
fn load_notice(config: &PersistConfig) -> Option<String> {
    if config.persist_mempool {
        None
    } else {
        Some("persist_mempool is off: a node with this configuration would not load this file".to_string())
    }
}

fn verify(path: &Path, config: &PersistConfig) -> Result<(), anyhow::Error> {
    info!("Verifying mempool file: {}", path.display());

    if temp_path_for(path).exists() {
        warn!(
            "Leftover {} found; run `mempersist clean-temp` to remove it",
            temp_path_for(path).display()
        );
    }

    match read_snapshot(path) {
        Ok((snapshot, file_size, _)) => {
            println!(
                "✓ Mempool file is valid: {} transactions, {}",
                snapshot.len(),
                format_size(file_size as u64)
            );
            if let Some(notice) = load_notice(config) {
                warn!("{}", notice);
                println!("! {}", notice);
            }
            Ok(())
        }
        Err(e) => {
            match e.downcast_ref::<FormatError>() {
                Some(FormatError::ChecksumMismatch { expected, actual }) => {
                    error!("✗ Checksum mismatch:");
                    error!("  Expected: {}", expected);
                    error!("  Actual: {}", actual);
                }
                _ => error!("✗ Failed to verify mempool file: {}", e),
            }
            Err(e)
        }
    }
}

fn clean_temp(path: &Path) -> Result<(), anyhow::Error> {
    let temp = temp_path_for(path);
    if AtomicFileWriter::new().remove_stale_temp(path)? {
        println!("✓ Removed {}", temp.display());
    } else {
        println!("No leftover file at {}", temp.display());
    }
    Ok(())
}

fn compression_name(id: u8) -> String {
    match mempersist_core::compression::adapter_for_id(id) {
        Ok(adapter) => adapter.algorithm_name().to_string(),
        Err(_) => format!("unknown ({id})"),
    }
}

fn short_hash(hex: &str) -> String {
    if hex.len() > 16 {
        format!("{}…", &hex[..16])
    } else {
        hex.to_string()
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
