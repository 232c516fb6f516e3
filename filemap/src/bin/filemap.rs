//! Command line access to a file map.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use filemap::{Config, FileMap, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "filemap")]
#[command(about = "Inspect and edit fixed-capacity file maps", long_about = None)]
struct Cli {
    /// Path to the map file
    #[arg(short, long, default_value = "./data.map")]
    path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the file, or reinitialize it if it is incompatible
    Create {
        /// Maximum number of records
        #[arg(short, long)]
        capacity: u32,
    },

    /// Print the value stored under a key
    Get { key: String },

    /// Store a value under a key
    Set {
        key: String,
        value: String,

        /// Fsync before returning
        #[arg(long)]
        sync: bool,
    },

    /// Remove a key
    Delete { key: String },

    /// List all keys
    List,

    /// Show capacity and usage
    Stat,

    /// Write a debug description of the file
    Dump {
        /// Output file
        #[arg(short, long, default_value = "./filemap-info.txt")]
        out: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let load = |cfg: Config| {
        FileMap::open(&cli.path, cfg).with_context(|| format!("opening {}", cli.path.display()))
    };

    match &cli.command {
        Commands::Create { capacity } => {
            let map = load(Config::create(*capacity))?;
            println!(
                "{}: capacity {}, {} records",
                cli.path.display(),
                map.capacity(),
                map.len()?
            );
            map.close()?;
        }
        Commands::Get { key } => {
            let map = load(Config::load())?;
            match map.get(key)? {
                Some(value) => println!("{}", String::from_utf8_lossy(value.trimmed())),
                None => bail!("key {key:?} not found"),
            }
        }
        Commands::Set { key, value, sync } => {
            let map = load(Config::load().with_sync_writes(*sync))?;
            let value = Value::new(value)?;
            map.set(key, &value)?;
            map.close()?;
        }
        Commands::Delete { key } => {
            let map = load(Config::load())?;
            if !map.delete(key)? {
                bail!("key {key:?} not found");
            }
            map.close()?;
        }
        Commands::List => {
            let map = load(Config::load())?;
            for key in map.keys()? {
                println!("{}", key.to_string_lossy());
            }
        }
        Commands::Stat => {
            let map = load(Config::load())?;
            let layout = map.segment_map();
            println!("capacity:      {}", map.capacity());
            println!("records:       {}", map.len()?);
            println!("primary slots: {}", filemap::layout::primary_slots(map.capacity()));
            println!("index bytes:   {}", layout.index.seg.size);
            println!("max file size: {}", layout.seg.size);
        }
        Commands::Dump { out } => {
            let map = load(Config::load())?;
            map.dump_debug_info(out)?;
            println!("wrote {}", out.display());
        }
    }
    Ok(())
}
