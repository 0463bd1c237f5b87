use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use edge_gallery_downloads::core::settings::DownloadSettings;
use edge_gallery_downloads::core::status::{StatusStore, TransferState, TransferStatus};
use edge_gallery_downloads::models::{ModelDownloadJob, ModelDownloadService, ModelManager};
use parking_lot::Mutex;
use tracing::info;
use tracing::metadata::LevelFilter;

#[derive(Parser)]
#[command(name = "edge-models", version, about = "Download and manage on-device models")]
struct Cli {
    /// Storage root, overrides config and EDGE_MODELS_DIR
    #[arg(long, global = true)]
    models_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List registered models and their download status
    List,
    /// Register every model in an allowlist JSON file
    Add { allowlist: PathBuf },
    /// Copy a local model file into storage
    Import {
        path: PathBuf,
        #[arg(long)]
        name: String,
    },
    /// Download (or resume) a model and its extra files
    Download {
        name: String,
        /// Bearer token for gated repositories
        #[arg(long, env = "EDGE_AUTH_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
    /// Show the on-disk status of one model
    Status { name: String },
    /// Remove a model's local files
    Delete { name: String },
}

fn setup_logging() {
    let filter = std::env::var("EDGE_LOG")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_target(false)
        .compact()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn describe(state: &TransferState) -> String {
    match state.status {
        TransferStatus::Failed => format!(
            "failed: {}",
            state.error_message.as_deref().unwrap_or("unknown error")
        ),
        status => match state.percent() {
            Some(percent) => format!("{status:?} ({percent}%, {} bytes)", state.received_bytes),
            None => format!("{status:?} ({} bytes)", state.received_bytes),
        },
    }
}

fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let mut settings = DownloadSettings::load()?;
    if let Some(dir) = cli.models_dir {
        settings.models_dir = Some(dir);
    }
    let manager = ModelManager::open(settings.models_dir()?)?;
    let manager = Arc::new(Mutex::new(manager));
    let store = Arc::new(StatusStore::new());
    let service = ModelDownloadService::new(&settings, manager.clone(), store.clone())?;

    match cli.command {
        Command::List => {
            service.refresh_status()?;
            for descriptor in manager.lock().descriptors() {
                let state = store.get(&descriptor.name);
                println!("{:<40} {}", descriptor.name, describe(&state));
            }
        }
        Command::Add { allowlist } => {
            let count = manager.lock().register_all(&allowlist)?;
            println!("registered {count} models");
        }
        Command::Import { path, name } => {
            let descriptor = manager.lock().import_local(&path, &name)?;
            println!("imported {} ({} bytes)", descriptor.name, descriptor.size_bytes);
        }
        Command::Status { name } => {
            service.refresh_status()?;
            if manager.lock().descriptor(&name).is_none() {
                bail!("unknown model {name}");
            }
            println!("{}", describe(&store.get(&name)));
        }
        Command::Delete { name } => {
            service.delete(&name)?;
            println!("deleted {name}");
        }
        Command::Download { name, token } => {
            let mut updates = store.subscribe(&name);
            service.queue(ModelDownloadJob {
                name: name.clone(),
                auth_token: token,
            })?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .context("start status runtime")?;
            let state = runtime.block_on(async {
                loop {
                    updates
                        .changed()
                        .await
                        .context("status channel closed")?;
                    let state = updates.borrow_and_update().clone();
                    match state.status {
                        TransferStatus::InProgress => info!(
                            "{name}: {} bytes, {} B/s, {} ms left",
                            state.received_bytes, state.bytes_per_second, state.remaining_ms
                        ),
                        TransferStatus::Unzipping => info!("{name}: expanding archive"),
                        _ => return Ok::<_, anyhow::Error>(state),
                    }
                }
            })?;
            if state.status != TransferStatus::Succeeded {
                bail!("{name}: {}", describe(&state));
            }
            println!("{name}: {}", describe(&state));
        }
    }
    Ok(())
}
