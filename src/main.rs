use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use querycache::cache::{CacheEngine, SqliteStore};
use querycache::config::Config;
use querycache::{BasicQueryLogic, IdSchema};

#[derive(Parser, Debug)]
#[command(name = "querycache")]
#[command(about = "Inspect and maintain a set-indexed query-result cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/querycache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache namespace to operate on
  #[arg(short, long)]
  namespace: Option<String>,

  /// SQLite database file
  #[arg(short, long)]
  database: Option<PathBuf>,

  /// Write logs to this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Print the cached result of a descriptor
  GetList { descriptor: String },
  /// Print a cached record, identified by a (partial) record
  Get { record: String },
  /// Cache a JSON array of records as the result of a descriptor
  PutList { descriptor: String, records: String },
  /// Add a new record to every matching cached result
  Create { record: String },
  /// Re-file a changed record across cached results
  Update { record: String },
  /// Remove a record everywhere
  Destroy { record: String },
  /// Drop one cached result, keeping its records
  Evict { descriptor: String },
  /// List cached descriptors
  Sets,
  /// Remove every cached result and record in the namespace
  Reset,
}

fn parse_json(label: &str, raw: &str) -> Result<Value> {
  serde_json::from_str(raw).map_err(|e| eyre!("Invalid {} JSON: {}", label, e))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

/// Install the tracing subscriber. The returned guard flushes file logs on drop.
fn init_logging(log_dir: Option<&PathBuf>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_env("QUERYCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

  match log_dir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::never(dir, "querycache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}

fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, command line wins
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(namespace) = args.namespace {
    config.namespace = namespace;
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }
  if let Some(log_dir) = args.log_dir {
    config.log_dir = Some(log_dir);
  }

  let _guard = init_logging(config.log_dir.as_ref())?;

  let store = match &config.database {
    Some(path) => SqliteStore::open(path),
    None => SqliteStore::open_default(),
  }
  .map_err(|e| eyre!("Failed to open cache database: {}", e))?;

  let schema = IdSchema::new(config.id_fields.clone());
  let logic = BasicQueryLogic::new(schema.clone()).with_paging(config.paging.clone());
  let mut cache =
    CacheEngine::open(&config.namespace, store, logic, schema)?.with_merge_mode(config.merge);

  match args.command {
    Command::GetList { descriptor } => {
      let records = cache.get_list_data(&parse_json("descriptor", &descriptor)?)?;
      print_json(&records)?;
    }
    Command::Get { record } => {
      let found = cache.get_instance_data(&parse_json("record", &record)?)?;
      print_json(&found)?;
    }
    Command::PutList {
      descriptor,
      records,
    } => {
      let records = match parse_json("records", &records)? {
        Value::Array(records) => records,
        _ => return Err(eyre!("Records must be a JSON array")),
      };
      cache.update_list_data(records, &parse_json("descriptor", &descriptor)?)?;
    }
    Command::Create { record } => cache.create_instance_data(parse_json("record", &record)?)?,
    Command::Update { record } => cache.update_instance_data(parse_json("record", &record)?)?,
    Command::Destroy { record } => cache.destroy_instance_data(&parse_json("record", &record)?)?,
    Command::Evict { descriptor } => {
      if !cache.evict_list_data(&parse_json("descriptor", &descriptor)?)? {
        return Err(eyre!("No cached result for {}", descriptor));
      }
    }
    Command::Sets => print_json(&cache.cached_descriptors()?)?,
    Command::Reset => cache.reset()?,
  }

  Ok(())
}
