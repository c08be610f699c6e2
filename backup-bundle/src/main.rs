//! backup-bundle - command line entry point
//!
//! Pushes a data directory as a base backup, fetches one back, or lists the
//! backups in storage.

use anyhow::Result;
use backup_bundle::backup::fetch::FetchOptions;
use backup_bundle::backup::{self, push_backup, BackupSelector, PushArguments};
use backup_bundle::composer::ComposerKind;
use backup_bundle::{config::Config, daemon::shutdown::ShutdownCoordinator, utils};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Make a backup and upload it to storage
    Push {
        db_directory: PathBuf,

        /// Push a permanent backup
        #[arg(short, long)]
        permanent: bool,

        /// Make a full backup
        #[arg(short, long)]
        full: bool,

        /// Use the rating composer
        #[arg(short = 'r', long)]
        rating_composer: bool,

        /// Use the copy composer
        #[arg(short = 'C', long)]
        copy_composer: bool,

        /// Use the backup with this name as the delta base
        #[arg(long)]
        delta_from_name: Option<String>,

        /// Use the backup with this user data as the delta base
        #[arg(long)]
        delta_from_user_data: Option<String>,

        /// User data stored in the backup manifest
        #[arg(long)]
        add_user_data: Option<String>,

        /// Do not track files metadata
        #[arg(long)]
        without_files_metadata: bool,
    },

    /// Restore a backup into a directory
    Fetch {
        /// Backup name or LATEST
        backup_name: String,

        destination: PathBuf,

        /// Fail on archive entries that cannot be recreated
        #[arg(long)]
        strict: bool,
    },

    /// List stored backups
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("backup-bundle v{}", env!("CARGO_PKG_VERSION"));

    let storage = config.storage.open()?;

    match args.command {
        Command::Push {
            db_directory,
            permanent,
            full,
            rating_composer,
            copy_composer,
            delta_from_name,
            delta_from_user_data,
            add_user_data,
            without_files_metadata,
        } => {
            let mut push = PushArguments::from_settings(db_directory, &config.backup);
            push.permanent = permanent;
            push.full_backup = full;
            push.without_files_metadata |= without_files_metadata;
            if rating_composer {
                push.composer = ComposerKind::Rating;
            }
            if copy_composer {
                push.composer = ComposerKind::Copy;
            }
            if delta_from_name.is_some() {
                push.delta_from_name = delta_from_name;
            }
            if delta_from_user_data.is_some() {
                push.delta_from_user_data = delta_from_user_data;
            }
            if add_user_data.is_some() {
                push.user_data = add_user_data;
            }
            let plan = push.validate()?;

            let shutdown = ShutdownCoordinator::new();
            let watcher = shutdown.clone();
            let signals = tokio::spawn(async move { watcher.wait_for_signal().await });

            let result = push_backup(plan, &config.bundle, storage, shutdown.token()).await;
            signals.abort();

            let manifest = result?;
            println!("{}", manifest.name);
        }
        Command::Fetch {
            backup_name,
            destination,
            strict,
        } => {
            let options = FetchOptions {
                strict,
                concurrency: config.bundle.upload_concurrency,
                codec: None,
            };
            let selector = BackupSelector::from_name(&backup_name);
            let report = backup::fetch_backup(storage, &selector, &destination, &options).await?;
            tracing::info!(
                "Fetched {}: {} entries, {} skipped, {} unsupported",
                backup_name,
                report.extracted,
                report.skipped,
                report.unsupported.len()
            );
        }
        Command::List => {
            for manifest in backup::list_backups(storage.as_ref()).await? {
                println!(
                    "{}\t{}\t{}\t{}{}",
                    manifest.name,
                    manifest.finish_time.to_rfc3339(),
                    manifest.total_bytes,
                    manifest.composer,
                    if manifest.is_permanent { "\tpermanent" } else { "" }
                );
            }
        }
    }

    Ok(())
}
