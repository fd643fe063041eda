use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use walstore::transaction::wal::{LogManager, LogManagerConfig, LogRecordType};
use walstore::{Database, DatabaseConfig};

#[derive(Parser)]
#[command(author, version, about = "walstore - inspect and maintain a walstore database directory")]
struct Cli {
    /// Database directory
    #[arg(short, long, default_value = "walstore_data")]
    db_dir: PathBuf,

    /// Block size used by the data files and the log
    #[arg(short, long, default_value_t = walstore::common::types::PAGE_SIZE)]
    block_size: usize,

    /// Buffer pool size (number of frames)
    #[arg(short, long, default_value_t = 64)]
    pool_size: usize,

    /// Log file name inside the database directory
    #[arg(short, long, default_value = "walstore.log")]
    log_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run crash recovery and report what it did
    Recover,

    /// Open the database and take a checkpoint
    Checkpoint,

    /// Print the log records, oldest first
    DumpLog {
        /// Log offset to start from
        #[arg(long, default_value_t = 0)]
        from: u64,

        /// Only print records of this transaction
        #[arg(long)]
        txn: Option<u32>,
    },

    /// Show log and buffer pool statistics
    Stats,
}

impl Cli {
    fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            block_size: self.block_size,
            pool_size: self.pool_size,
            log_file_name: self.log_file.clone(),
            ..DatabaseConfig::new(&self.db_dir)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Recover => {
            let db = Database::open(cli.database_config())
                .with_context(|| format!("failed to open {:?}", cli.db_dir))?;
            let stats = db.recovery_stats().clone();
            println!("Records scanned:       {}", stats.records_scanned);
            println!("Page records redone:   {}", stats.pages_redone);
            println!("Records undone:        {}", stats.records_undone);
            println!("Transactions undone:   {}", stats.transactions_undone);
            println!("Transactions ended:    {}", stats.transactions_ended);
            println!("Largest transaction:   {}", stats.max_txn_id);
            db.close()?;
        }
        Commands::Checkpoint => {
            let db = Database::open(cli.database_config())
                .with_context(|| format!("failed to open {:?}", cli.db_dir))?;
            let position = db.checkpoint()?;
            println!("Checkpoint written at LSN {} (offset {})", position.lsn, position.offset);
            db.buffer_pool().flush_all()?;
        }
        Commands::DumpLog { from, txn } => {
            // Read the log as it is on disk, without recovering first
            let config = cli.database_config();
            let log = LogManager::new(LogManagerConfig {
                log_path: config.log_path(),
                block_size: config.block_size,
                force_sync: false,
            })
            .with_context(|| format!("failed to open log {:?}", config.log_path()))?;

            if let Some(offset) = log.read_master()? {
                println!("Master record -> offset {}", offset);
            }
            let mut printed = 0;
            for item in log.iter_records_from(*from)? {
                let (offset, record) = item?;
                if txn.is_some_and(|id| id != record.txn_id) {
                    continue;
                }
                let marker = if record.record_type() == LogRecordType::CheckpointEnd { "*" } else { " " };
                println!("{}{:>10}  {}", marker, offset, record);
                printed += 1;
            }
            println!("{} records", printed);
        }
        Commands::Stats => {
            let db = Database::open(cli.database_config())
                .with_context(|| format!("failed to open {:?}", cli.db_dir))?;
            let log = db.log_manager().stats();
            println!("Log file:        {:?}", db.log_manager().log_path());
            println!("Log blocks:      {}", log.blocks);
            println!("Next LSN:        {}", log.next_lsn);
            println!("Flushed LSN:     {}", log.flushed_lsn);
            println!("End offset:      {}", log.end_offset);
            match db.log_manager().read_master()? {
                Some(offset) => println!("Last checkpoint: offset {}", offset),
                None => println!("Last checkpoint: none"),
            }

            let pool = db.buffer_pool();
            let stats = pool.stats();
            println!("Pool frames:     {} ({} available)", pool.pool_size(), pool.available());
            println!("Pool hits:       {}", stats.hits);
            println!("Pool misses:     {}", stats.misses);
            println!("Pool evictions:  {}", stats.evictions);
            println!("Pool writes:     {}", stats.writes);
            println!("Dirty pages:     {}", pool.dirty_page_table().len());
        }
    }

    Ok(())
}
