//! JobSync CLI - Command line interface for the offline sync engine.
//!
//! This tool operates on a local JobSync database: inspecting and editing
//! the mutation queue, replaying it against the backend, refreshing local
//! data and resolving record conflicts offline.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use jobsync_common::{EntityType, MutationAction, Record};
use jobsync_crypto::{FieldCipher, FileKeyStore};
use jobsync_storage::{migrate_to_encrypted, EncryptedStore, LocalStore, NewQueueItem};
use jobsync_sync::{resolve_conflict_named, HttpRemote, RemoteConfig, SyncEvent, SyncManager};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "jobsync")]
#[command(about = "JobSync - Offline sync engine tools")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: platform data dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file.
    InitConfig {
        /// Root URL of the backend table API.
        #[arg(long)]
        base_url: Option<String>,

        /// API key sent as bearer token.
        #[arg(long)]
        api_key: Option<String>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Show collection counts and queue size.
    Stats,

    /// List queued mutations.
    Queue,

    /// Drop every queued mutation.
    ClearQueue,

    /// Queue a mutation.
    Enqueue {
        /// Entity kind: job, quote, invoice or client.
        #[arg(short, long)]
        entity: EntityType,

        /// Entity id (UUID v4).
        #[arg(short, long)]
        id: String,

        /// Action: create, update or delete.
        #[arg(short, long)]
        action: MutationAction,

        /// Mutation payload as a JSON object.
        #[arg(short, long, default_value = "{}")]
        data: String,
    },

    /// Replay the queue against the backend.
    Sync,

    /// Refresh local collections from the backend.
    Fetch {
        /// Owner whose records are fetched.
        #[arg(short, long)]
        owner: String,
    },

    /// Encrypt records stored before field encryption existed.
    MigrateEncryption,

    /// Resolve two versions of a record offline.
    Resolve {
        /// JSON file with the local version.
        #[arg(short, long)]
        local: PathBuf,

        /// JSON file with the server version.
        #[arg(short, long)]
        server: PathBuf,

        /// server-wins, client-wins, last-write-wins or merge.
        #[arg(long, default_value = "last-write-wins")]
        strategy: String,
    },

    /// Wipe local data and destroy the encryption key.
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);

    match cli.command {
        Commands::InitConfig {
            base_url,
            api_key,
            force,
        } => cmd_init_config(&config_path, base_url, api_key, force),

        Commands::Stats => cmd_stats(&config_path),

        Commands::Queue => cmd_queue(&config_path),

        Commands::ClearQueue => cmd_clear_queue(&config_path),

        Commands::Enqueue {
            entity,
            id,
            action,
            data,
        } => cmd_enqueue(&config_path, entity, &id, action, &data),

        Commands::Sync => cmd_sync(&config_path).await,

        Commands::Fetch { owner } => cmd_fetch(&config_path, &owner).await,

        Commands::MigrateEncryption => cmd_migrate_encryption(&config_path),

        Commands::Resolve {
            local,
            server,
            strategy,
        } => cmd_resolve(&local, &server, &strategy),

        Commands::Logout => cmd_logout(&config_path),
    }
}

fn open_store(config: &AppConfig) -> Result<EncryptedStore> {
    let store = LocalStore::open(config.store_config()).with_context(|| {
        format!(
            "Failed to open local store {}",
            config.database_path.display()
        )
    })?;

    for failure in &store.migration_report().failed_fixups {
        warn!(
            "Schema step v{} ({}) fixup failed: {}",
            failure.version, failure.name, failure.error
        );
    }

    let cipher = FieldCipher::new(Arc::new(FileKeyStore::new(&config.key_path)));
    Ok(EncryptedStore::new(Arc::new(store), Arc::new(cipher)))
}

fn open_manager(config: &AppConfig) -> Result<Arc<SyncManager>> {
    let remote_config = config
        .remote
        .as_ref()
        .context("No remote configured; run `jobsync init-config --base-url ...`")?;
    let remote = HttpRemote::new(remote_config).context("Invalid remote configuration")?;

    let manager = Arc::new(SyncManager::new(
        open_store(config)?,
        Arc::new(remote),
        config.sync.clone(),
    ));
    let _events = manager.subscribe(print_event);
    manager.set_online(true);
    Ok(manager)
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::SyncProgress { .. } => {}
        SyncEvent::ConflictDetected { message, .. } => println!("  conflict: {}", message),
        SyncEvent::MutationAbandoned {
            entity_type,
            entity_id,
            error,
            ..
        } => println!("  abandoned {} {}: {}", entity_type, entity_id, error),
        SyncEvent::AuthError { message } => println!("  authentication failed: {}", message),
        SyncEvent::QueueCorrupted { message } | SyncEvent::StorageQuotaExceeded { message } => {
            println!("  warning: {}", message)
        }
    }
}

fn read_record(path: &Path) -> Result<Record> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON object", path.display()))
}

/// Write a configuration file.
fn cmd_init_config(
    path: &Path,
    base_url: Option<String>,
    api_key: Option<String>,
    force: bool,
) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }

    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut config = AppConfig::in_dir(&dir);
    if let Some(base_url) = base_url {
        config.remote = Some(RemoteConfig {
            base_url,
            api_key: api_key.unwrap_or_default(),
        });
    }
    config.save(path)?;

    println!("Configuration written to {}", path.display());
    println!("  Database: {}", config.database_path.display());
    println!("  Key file: {}", config.key_path.display());
    Ok(())
}

/// Show collection counts.
fn cmd_stats(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let store = open_store(&config)?;
    let stats = store.store().get_stats().context("Failed to read stats")?;

    println!("Schema version: v{}", store.store().migration_report().to_version);
    println!("  Jobs:     {}", stats.jobs);
    println!("  Quotes:   {}", stats.quotes);
    println!("  Invoices: {}", stats.invoices);
    println!("  Clients:  {}", stats.clients);
    println!(
        "  Queue:    {} ({} pending)",
        stats.queue_total, stats.pending_sync
    );
    Ok(())
}

/// List queued mutations.
fn cmd_queue(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let store = open_store(&config)?;
    let items = store.store().queue_items().context("Failed to read queue")?;

    if items.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }

    for item in items {
        println!(
            "#{:<5} {:<9} {:<7} {:<8} {} retries={}{}",
            item.id,
            item.state.as_str(),
            item.action,
            item.entity_type,
            item.entity_id,
            item.retry_count,
            item.sync_error
                .map(|e| format!(" error={}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Drop every queued mutation.
fn cmd_clear_queue(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let store = open_store(&config)?;
    store.store().clear_queue().context("Failed to clear queue")?;
    println!("Queue cleared");
    Ok(())
}

/// Queue a mutation.
fn cmd_enqueue(
    config_path: &Path,
    entity: EntityType,
    id: &str,
    action: MutationAction,
    data: &str,
) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let store = open_store(&config)?;
    let data: serde_json::Value = serde_json::from_str(data).context("--data is not valid JSON")?;

    let queue_id = store
        .store()
        .add_queue_item(&NewQueueItem::new(entity, id, action, data))
        .context("Mutation rejected")?;

    info!("Queued {} {} {}", action, entity, id);
    println!("Queued as #{}", queue_id);
    Ok(())
}

/// Replay the queue.
async fn cmd_sync(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let manager = open_manager(&config)?;
    manager.run_encryption_migration();

    let summary = manager.process_queue().await;
    println!(
        "Synced {}, failed {}, deferred {}",
        summary.success, summary.failed, summary.deferred
    );
    println!("Pending: {}", manager.get_pending_sync_count());
    Ok(())
}

/// Refresh local collections.
async fn cmd_fetch(config_path: &Path, owner: &str) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let manager = open_manager(&config)?;

    let summary = manager.fetch_and_store(owner).await;
    for (entity, count) in &summary.stored {
        println!("  {:<9} {}", entity.table_name(), count);
    }
    if !summary.failed.is_empty() {
        let failed: Vec<_> = summary.failed.iter().map(|e| e.table_name()).collect();
        anyhow::bail!("Refresh failed for: {}", failed.join(", "));
    }
    Ok(())
}

/// Encrypt legacy plaintext rows.
fn cmd_migrate_encryption(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let store = open_store(&config)?;
    let report = migrate_to_encrypted(&store).context("Encryption migration failed")?;

    if report.skipped {
        println!("Encryption migration already completed");
    } else {
        for (entity, count) in &report.migrated {
            println!("  {:<9} {}", entity.table_name(), count);
        }
        println!("Encrypted {} records", report.total());
    }
    Ok(())
}

/// Resolve two versions of a record.
fn cmd_resolve(local: &Path, server: &Path, strategy: &str) -> Result<()> {
    let local = read_record(local)?;
    let server = read_record(server)?;

    let resolution = resolve_conflict_named(&local, &server, strategy);
    eprintln!("{} ({})", resolution.message, resolution.strategy);
    if resolution.had_conflict {
        let fields = jobsync_sync::conflicting_fields(
            &local,
            &server,
            jobsync_sync::DEFAULT_IGNORE_FIELDS,
        );
        eprintln!("Conflicting fields: {}", fields.join(", "));
    }
    println!("{}", serde_json::to_string_pretty(&resolution.resolved)?);
    Ok(())
}

/// Wipe local data.
fn cmd_logout(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    let store = open_store(&config)?;
    store.store().wipe().context("Failed to wipe local store")?;
    store
        .cipher()
        .destroy_key()
        .context("Failed to destroy encryption key")?;
    println!("Local data wiped");
    Ok(())
}
