//! Add one root and run a single pass over it, then exit.

use anyhow::Result;
use clap::Parser;
use gencat::events::DomainEvent;
use gencat::paths::path_key;
use gencat::{catalog, Config, Coordinator, EventSink};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "scan")]
#[command(about = "Catalog every image under a folder once and exit")]
struct Args {
    /// Folder to scan
    root: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", &config.catalog.log_level),
    )
    .init();

    let args = Args::parse();
    let root = args.root.canonicalize()?;

    let db = catalog::open(config.db_path(), config.migrations_dir()).await?;
    let (events, mut rx) = EventSink::channel();
    let coordinator = Coordinator::start(
        db.clone(),
        gencat::ingest_context(&config)?,
        events,
        gencat::coordinator_settings(&config),
    );

    if !coordinator.add_folder(&root).await? {
        // Already covered by a registered root: scan just this subtree
        coordinator.enqueue_scan(&root);
    }
    let key = path_key(&root);
    log::info!("Scanning {}", key);

    // A pass with files reports processed == total twice: after the last
    // file, and again once the batch is committed
    let (mut added, mut removed, mut finished) = (0usize, 0usize, 0usize);
    while let Some(event) = rx.recv().await {
        match event {
            DomainEvent::PhotoAdded(_) => added += 1,
            DomainEvent::PhotoRemoved(_) => removed += 1,
            DomainEvent::ScanProgress { path, processed, total } if path == key && processed == total => {
                finished += 1;
                if total == 0 || finished == 2 {
                    break;
                }
            }
            _ => {}
        }
    }

    coordinator.shutdown().await;
    let photos = catalog::photo_paths_under(&db, &key).await?.len();
    println!("{}: {} added, {} removed, {} catalogued", key, added, removed, photos);
    Ok(())
}
