//! BridgeFS - FUSE bridge onto a versioned, content-addressed file store
//!
//! Usage:
//!   bridgefs init                          - Write a default configuration
//!   bridgefs mount <mount_point>           - Mount the filesystem
//!   bridgefs unmount <mount_point>         - Unmount it
//!   bridgefs status                        - Show configuration and stores
//!   bridgefs transfer open <project> <user>
//!   bridgefs file <project> <path>         - Show the current record

use anyhow::{bail, Context, Result};
use bridgefs::{
    config::Config,
    fs::{BridgeFs, BridgeServices},
    metadata::{MetadataStore, PersistenceGateway},
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bridgefs")]
#[command(version)]
#[command(about = "FUSE bridge onto a versioned, content-addressed file store")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/bridgefs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and create the stores
    Init {
        /// Root of the sharded content store
        #[arg(long)]
        content_root: Option<PathBuf>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Mount the filesystem
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },

    /// Unmount the filesystem
    Unmount {
        /// Mount point to unmount
        mount_point: PathBuf,
    },

    /// Show configuration and store statistics
    Status,

    /// Manage transfer requests
    Transfer {
        #[command(subcommand)]
        action: TransferAction,
    },

    /// Show the current record of a project path
    File {
        project: i64,
        /// Path relative to the project, e.g. /dir1/file.txt
        path: String,
    },
}

#[derive(Subcommand)]
enum TransferAction {
    /// Open a transfer request, making the project/user tree visible
    Open { project: i64, user: i64 },
    /// Close the open transfer request
    Close { project: i64, user: i64 },
    /// List open transfer requests
    List,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = expand_tilde(&cli.config);

    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            content_root,
            force,
        } => cmd_init(config_path, content_root, force),
        Commands::Mount {
            mount_point,
            allow_other,
        } => cmd_mount(config_path, &mount_point, allow_other),
        Commands::Unmount { mount_point } => cmd_unmount(&mount_point),
        Commands::Status => cmd_status(config_path),
        Commands::Transfer { action } => cmd_transfer(config_path, action),
        Commands::File { project, path } => cmd_file(config_path, project, &path),
    }
}

fn load_config(config_path: &Path) -> Result<Config> {
    Config::load(config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))
}

fn open_store(config: &Config) -> Result<MetadataStore> {
    MetadataStore::open(&config.storage.metadata_db).with_context(|| {
        format!(
            "opening metadata database {}",
            config.storage.metadata_db.display()
        )
    })
}

fn cmd_init(config_path: &Path, content_root: Option<PathBuf>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "{} already exists, pass --force to overwrite",
            config_path.display()
        );
    }

    info!("Initializing BridgeFS...");

    let mut config = Config::default();
    if let Some(root) = content_root {
        config.storage.content_root = root;
    }
    config.apply_env_overrides();
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    config.save(config_path)?;
    config.ensure_directories()?;

    // creates the sled trees
    open_store(&config)?.flush()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Content root: {:?}", config.storage.content_root);
    info!("Metadata database: {:?}", config.storage.metadata_db);
    Ok(())
}

fn cmd_mount(config_path: &Path, mount_point: &Path, allow_other: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.mount.mount_point = mount_point.to_path_buf();
    config.mount.allow_other |= allow_other;
    config.ensure_directories()?;

    let store = open_store(&config)?;
    let services = BridgeServices::with_store(store, &config);
    let fs = BridgeFs::new(services, config.mount.worker_threads)
        .context("starting request workers")?;

    std::fs::create_dir_all(mount_point)
        .with_context(|| format!("creating mount point {}", mount_point.display()))?;

    let mut options = vec![
        fuser::MountOption::FSName("bridgefs".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if config.mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    info!(
        mount_point = %mount_point.display(),
        content_root = %config.storage.content_root.display(),
        dedup = config.dedup.enabled,
        workers = config.mount.worker_threads,
        "mounting"
    );
    fuser::mount2(fs, mount_point, &options)
        .with_context(|| format!("mounting at {}", mount_point.display()))?;
    Ok(())
}

fn cmd_unmount(mount_point: &Path) -> Result<()> {
    info!("Unmounting {:?}...", mount_point);

    #[cfg(target_os = "linux")]
    let output = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .output()
        .context("running fusermount")?;

    #[cfg(not(target_os = "linux"))]
    let output = std::process::Command::new("umount")
        .arg(mount_point)
        .output()
        .context("running umount")?;

    if !output.status.success() {
        bail!(
            "failed to unmount: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    info!("Unmounted successfully");
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;

    println!("BridgeFS Status");
    println!("===============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Content root: {:?}", config.storage.content_root);
    println!("Metadata database: {:?}", config.storage.metadata_db);
    println!("Mount point: {:?}", config.mount.mount_point);
    println!("Gateway retries: {}", config.gateway.tx_retry);
    if config.dedup.enabled {
        println!("Deduplication: enabled ({:?} scope)", config.dedup.scope);
    } else {
        println!("Deduplication: disabled");
    }

    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => {
            // sled holds an exclusive lock while mounted
            println!("Metadata: unavailable ({:#})", e);
            return Ok(());
        }
    };

    let transfers = store.list_transfer_requests()?;
    println!("Open transfer requests: {}", transfers.len());

    let mut projects: Vec<i64> = transfers.iter().map(|t| t.project_id).collect();
    projects.sort_unstable();
    projects.dedup();
    for project in projects {
        let stats = store.project_stats(project)?;
        println!(
            "  project {}: {} files, {} directories, {} bytes",
            project, stats.file_count, stats.directory_count, stats.size
        );
    }
    println!("Queued conversions: {}", store.list_conversions()?.len());
    Ok(())
}

fn cmd_transfer(config_path: &Path, action: TransferAction) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    match action {
        TransferAction::Open { project, user } => {
            let request = store.open_transfer_request(project, user)?;
            println!("transfer request {} open for /{}/{}", request.uuid, project, user);
        }
        TransferAction::Close { project, user } => {
            let request = store
                .close_transfer_request(project, user)
                .with_context(|| format!("closing transfer request for /{}/{}", project, user))?;
            println!("transfer request {} closed", request.uuid);
        }
        TransferAction::List => {
            for request in store.list_transfer_requests()? {
                println!(
                    "/{}/{}\t{}\tlast active {}",
                    request.project_id, request.owner_id, request.uuid, request.last_active_at
                );
            }
        }
    }

    store.flush()?;
    Ok(())
}

fn cmd_file(config_path: &Path, project: i64, path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    let record = store
        .find_file(project, path)
        .with_context(|| format!("looking up {} in project {}", path, project))?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
