//! bucketkv Admin Binary
//!
//! Opens a data directory and runs one administrative command against it.

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use bucketkv::codec::merge_area;
use bucketkv::config::{HourRange, IndexerStrategy};
use bucketkv::instance::Instance;
use bucketkv::{BucketError, Config, Item, StorageManager};

/// bucketkv admin
#[derive(Parser, Debug)]
#[command(name = "bucketkv-admin")]
#[command(about = "Administer a bucketkv data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./bucketkv_data")]
    data_dir: String,

    /// Number of engine instances
    #[arg(short, long, default_value = "3")]
    instances: usize,

    /// Total number of buckets
    #[arg(short, long, default_value = "1024")]
    buckets: u32,

    /// Bucket indexer strategy (hash | map)
    #[arg(short, long, default_value = "map")]
    strategy: IndexerStrategy,

    /// Compaction hour range, "min-max"
    #[arg(long, default_value = "0-23")]
    compact_hours: String,

    /// Enable the read cache with this many MB
    #[arg(long)]
    cache_mb: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Take ownership of buckets (all of them when none are listed)
    Init {
        /// Bucket ids
        ids: Vec<u32>,
    },

    /// Store a value
    Put {
        bucket: u32,
        key: String,
        value: String,

        /// Area number prefixed to the key
        #[arg(long, default_value = "0")]
        area: u16,

        /// Expire offset in seconds (or absolute unix time)
        #[arg(long, default_value = "0")]
        expire: u32,

        /// Expected version; enables version-care
        #[arg(long)]
        version: Option<u16>,
    },

    /// Read a value
    Get {
        bucket: u32,
        key: String,

        #[arg(long, default_value = "0")]
        area: u16,
    },

    /// Delete a value
    Remove {
        bucket: u32,
        key: String,

        #[arg(long, default_value = "0")]
        area: u16,
    },

    /// Stop serving buckets and collect their data
    Close {
        ids: Vec<u32>,
    },

    /// Mark an area as garbage on every instance
    Clear {
        area: u16,
    },

    /// Print per-instance usage
    Stats,

    /// Flush every memtable
    Flush,

    /// Run a manual compaction round
    Compact,

    /// Even out bucket ownership between instances
    Balance,

    /// List the records of one bucket
    Dump {
        bucket: u32,

        /// Stop after this many records
        #[arg(long, default_value = "100")]
        limit: usize,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bucketkv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("bucketkv admin v{}", bucketkv::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> bucketkv::Result<()> {
    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .instance_count(args.instances)
        .bucket_count(args.buckets)
        .indexer_strategy(args.strategy)
        .compact_hour_range(HourRange::parse(&args.compact_hours)?);
    if let Some(mb) = args.cache_mb {
        builder = builder.cache(true, mb * 1024 * 1024);
    }
    let manager = StorageManager::open(builder.build())?;

    let result = execute(&manager, args.command);
    manager.close()?;
    result
}

fn execute(manager: &StorageManager, command: Commands) -> bucketkv::Result<()> {
    match command {
        Commands::Init { ids } => {
            let ids = if ids.is_empty() {
                (0..manager.config().bucket_count).collect()
            } else {
                ids
            };
            manager.init_buckets(&ids)?;
            println!("initialized {} buckets", ids.len());
        }

        Commands::Put {
            bucket,
            key,
            value,
            area,
            expire,
            version,
        } => {
            let item = Item::with_version(value.into_bytes(), version.unwrap_or(0));
            let key = merge_area(area, key.as_bytes());
            let meta = manager.put(bucket, &key, &item, version.is_some(), expire)?;
            println!("OK version={} edate={}", meta.version, meta.edate);
        }

        Commands::Get { bucket, key, area } => {
            match manager.get(bucket, &merge_area(area, key.as_bytes())) {
                Ok(item) => println!(
                    "{} (version={} mdate={} edate={})",
                    String::from_utf8_lossy(&item.payload),
                    item.meta.version,
                    item.meta.mdate,
                    item.meta.edate
                ),
                Err(BucketError::NotFound) => println!("(not found)"),
                Err(e) => return Err(e),
            }
        }

        Commands::Remove { bucket, key, area } => {
            manager.remove(bucket, &merge_area(area, key.as_bytes()), false, 0)?;
            println!("OK");
        }

        Commands::Close { ids } => {
            manager.close_buckets(&ids)?;
            println!("closed {} buckets", ids.len());
        }

        Commands::Clear { area } => {
            manager.clear(area)?;
            println!("area {} cleared", area);
        }

        Commands::Stats => {
            let stats = manager.get_stats();
            for instance in &stats.instances {
                println!(
                    "ldb{}: buckets={} sstables={} l0={} memtable={}B pending_gc={:?}",
                    instance.index,
                    instance.buckets.len(),
                    instance.db.sstable_count,
                    instance.db.level0_count,
                    instance.db.memtable_bytes,
                    instance.pending_gc
                );
            }
            println!(
                "total: items={} data={}B use={}B",
                stats.total.item_count, stats.total.data_size, stats.total.use_size
            );
            if let Some(cache) = stats.cache {
                println!(
                    "cache: entries={} used={}B hit_rate={:.2}",
                    cache.entries,
                    cache.used_bytes,
                    cache.hit_rate()
                );
            }
        }

        Commands::Flush => {
            manager.flush_memtable()?;
            println!("OK");
        }

        Commands::Compact => {
            manager.compact()?;
            println!("OK");
        }

        Commands::Balance => {
            let report = manager.balance_now()?;
            println!(
                "planned={} moved={} stopped={}",
                report.planned,
                report.moved.len(),
                report.stopped
            );
            if let Some((unit, error)) = report.failed {
                println!("failed: bucket {} ({} -> {}): {}", unit.bucket, unit.from, unit.to, error);
            }
        }

        Commands::Dump { bucket, limit } => {
            let owner = manager
                .owner_of(bucket)
                .and_then(|index| manager.instance(index))
                .ok_or(BucketError::InstanceUnavailable(bucket))?;
            owner.begin_scan(bucket)?;
            let dumped = dump_scan(owner, limit);
            owner.end_scan();
            dumped?;
        }
    }
    Ok(())
}

/// Print up to `limit` items of the scan in progress on `instance`
fn dump_scan(instance: &Instance, limit: usize) -> bucketkv::Result<()> {
    let mut printed = 0;
    'pages: loop {
        let (items, more) = instance.get_next_items()?;
        for item in items {
            if printed == limit {
                break 'pages;
            }
            println!(
                "{:?} => {:?} (version={} edate={})",
                String::from_utf8_lossy(&item.key),
                String::from_utf8_lossy(&item.payload),
                item.meta.version,
                item.meta.edate
            );
            printed += 1;
        }
        if !more {
            break;
        }
    }
    Ok(())
}
