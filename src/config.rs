use crate::services::{
    broker::{ConsumerConfig, InitialOffset},
    dispatcher::DEFAULT_MIGRATION_TOPIC,
    mover::{DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_ATTEMPTS, DEFAULT_PART_SIZE, TransferSettings},
    worker::WorkerSettings,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// Which halves of the system this process runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum RunMode {
    /// REST API, trigger manager and dispatcher.
    Serve,
    /// Queue consumer and mover.
    Worker,
    /// Both in one process.
    All,
}

impl RunMode {
    pub fn runs_scheduler(&self) -> bool {
        matches!(self, RunMode::Serve | RunMode::All)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, RunMode::Worker | RunMode::All)
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub mode: RunMode,
    pub worker_concurrency: usize,
    pub lock_lease_secs: u64,
    pub multipart_threshold: u64,
    pub part_size: u64,
    pub part_attempts: u32,
    pub consumer_group: String,
    pub topic: String,
    pub poll_interval_ms: u64,
    pub initial_offset: InitialOffset,
    pub shutdown_grace_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Multi-cloud object migration service")]
pub struct Args {
    /// Host to bind to (overrides MOVER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MOVER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Root directory of the internal object store (overrides MOVER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MOVER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Process role (overrides MOVER_MODE)
    #[arg(long, value_enum)]
    pub mode: Option<RunMode>,

    /// Jobs a worker runs at once (overrides MOVER_WORKER_CONCURRENCY)
    #[arg(long)]
    pub worker_concurrency: Option<usize>,

    /// Schedule lock lease in seconds (overrides MOVER_LOCK_LEASE_SECS)
    #[arg(long)]
    pub lock_lease_secs: Option<u64>,

    /// Objects above this many bytes go multipart (overrides MOVER_MULTIPART_THRESHOLD)
    #[arg(long)]
    pub multipart_threshold: Option<u64>,

    /// Bytes per multipart part (overrides MOVER_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<u64>,

    /// Upload attempts per part (overrides MOVER_PART_ATTEMPTS)
    #[arg(long)]
    pub part_attempts: Option<u32>,

    /// Consumer group of the worker fleet (overrides MOVER_CONSUMER_GROUP)
    #[arg(long)]
    pub consumer_group: Option<String>,

    /// Topic run requests are published on (overrides MOVER_TOPIC)
    #[arg(long)]
    pub topic: Option<String>,

    /// Broker poll interval in milliseconds (overrides MOVER_POLL_INTERVAL_MS)
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Where a new consumer group starts reading (overrides MOVER_INITIAL_OFFSET)
    #[arg(long, value_enum)]
    pub initial_offset: Option<InitialOffset>,

    /// Seconds in-flight jobs get after shutdown (overrides MOVER_SHUTDOWN_GRACE_SECS)
    #[arg(long)]
    pub shutdown_grace_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_enum_or<T: ValueEnum>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => T::from_str(&value, true)
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", name, value, err)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// CLI values win; anything not given falls back to `MOVER_*`, then to
    /// the built-in default.
    pub fn from_args(args: Args) -> Result<Self> {
        Ok(Self {
            host: args.host.map_or_else(|| env_or("MOVER_HOST", "0.0.0.0".to_string()), Ok)?,
            port: args.port.map_or_else(|| env_or("MOVER_PORT", 3000), Ok)?,
            storage_dir: args
                .storage_dir
                .map_or_else(|| env_or("MOVER_STORAGE_DIR", "./data/objects".to_string()), Ok)?,
            database_url: args.database_url.map_or_else(
                || env_or("MOVER_DATABASE_URL", "sqlite://./data/meta/migrator.db".to_string()),
                Ok,
            )?,
            mode: args.mode.map_or_else(|| env_enum_or("MOVER_MODE", RunMode::All), Ok)?,
            worker_concurrency: args
                .worker_concurrency
                .map_or_else(|| env_or("MOVER_WORKER_CONCURRENCY", 8), Ok)?,
            lock_lease_secs: args
                .lock_lease_secs
                .map_or_else(|| env_or("MOVER_LOCK_LEASE_SECS", 300), Ok)?,
            multipart_threshold: args
                .multipart_threshold
                .map_or_else(|| env_or("MOVER_MULTIPART_THRESHOLD", DEFAULT_MULTIPART_THRESHOLD), Ok)?,
            part_size: args
                .part_size
                .map_or_else(|| env_or("MOVER_PART_SIZE", DEFAULT_PART_SIZE), Ok)?,
            part_attempts: args
                .part_attempts
                .map_or_else(|| env_or("MOVER_PART_ATTEMPTS", DEFAULT_PART_ATTEMPTS), Ok)?,
            consumer_group: args
                .consumer_group
                .map_or_else(|| env_or("MOVER_CONSUMER_GROUP", "migration-workers".to_string()), Ok)?,
            topic: args
                .topic
                .map_or_else(|| env_or("MOVER_TOPIC", DEFAULT_MIGRATION_TOPIC.to_string()), Ok)?,
            poll_interval_ms: args
                .poll_interval_ms
                .map_or_else(|| env_or("MOVER_POLL_INTERVAL_MS", 500), Ok)?,
            initial_offset: args
                .initial_offset
                .map_or_else(|| env_enum_or("MOVER_INITIAL_OFFSET", InitialOffset::Newest), Ok)?,
            shutdown_grace_secs: args
                .shutdown_grace_secs
                .map_or_else(|| env_or("MOVER_SHUTDOWN_GRACE_SECS", 30), Ok)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings {
            multipart_threshold: self.multipart_threshold,
            part_size: self.part_size,
            part_attempts: self.part_attempts,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            topic: self.topic.clone(),
            concurrency: self.worker_concurrency,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(&self.consumer_group, vec![self.topic.clone()]);
        config.poll_interval = Duration::from_millis(self.poll_interval_ms);
        config.initial_offset = self.initial_offset;
        config
    }
}
