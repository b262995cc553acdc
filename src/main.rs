use anyhow::Result;
use clap::{Parser, Subcommand};
use gencat::db::migrate;
use gencat::events::DomainEvent;
use gencat::{catalog, Config, Coordinator, EventSink};
use std::path::PathBuf;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser, Debug)]
#[command(name = "gencat")]
#[command(about = "Watch folders of generated images and catalog their generation metadata")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resume watching persisted folders and log catalog changes until Ctrl+C
    Run,
    /// Register folders to watch
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Verify the catalog schema
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", &config.catalog.log_level),
    )
    .init();

    let args = Args::parse();
    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Add { paths } => add(config, paths).await,
        Command::Verify => verify(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    log::info!("Starting gencat v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Catalog: {}", config.db_path().display());

    let db = catalog::open(config.db_path(), config.migrations_dir()).await?;
    let (events, rx) = EventSink::channel();
    let coordinator = Coordinator::start(
        db,
        gencat::ingest_context(&config)?,
        events,
        gencat::coordinator_settings(&config),
    );

    coordinator.initialize().await?;
    for root in &config.scan.roots {
        if let Err(e) = coordinator.add_folder(root).await {
            log::warn!("Cannot add configured root {}: {}", root.display(), e);
        }
    }

    let logger = tokio::spawn(log_events(rx));
    log::info!("Watching {} folder(s) (Ctrl+C to stop)", coordinator.watched_roots().len());
    tokio::signal::ctrl_c().await?;

    log::info!("Shutting down");
    coordinator.shutdown().await;
    drop(coordinator);
    logger.abort();
    Ok(())
}

async fn log_events(mut rx: UnboundedReceiver<DomainEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            DomainEvent::FolderAdded(path) => log::info!("+ folder {}", path),
            DomainEvent::FolderRemoved(path) => log::info!("- folder {}", path),
            DomainEvent::PhotoAdded(photo) => log::info!("+ photo {} ({} models)", photo.path, photo.models.len()),
            DomainEvent::PhotoRemoved(path) => log::info!("- photo {}", path),
            DomainEvent::ModelAdded { version_id, name, version_name } => {
                log::info!("+ model {} {} [{}]", name, version_name, version_id)
            }
            DomainEvent::ModelRemoved { version_id, name, version_name } => {
                log::info!("- model {} {} [{}]", name, version_name, version_id)
            }
            DomainEvent::ScanProgress { path, processed, total } => {
                log::debug!("scan {}: {}/{}", path, processed, total)
            }
        }
    }
}

async fn add(config: Config, paths: Vec<PathBuf>) -> Result<()> {
    let db = catalog::open(config.db_path(), config.migrations_dir()).await?;
    let (events, _rx) = EventSink::channel();
    let coordinator = Coordinator::start(
        db,
        gencat::ingest_context(&config)?,
        events,
        gencat::coordinator_settings(&config),
    );

    for path in &paths {
        match coordinator.add_folder(path).await {
            Ok(true) => println!("added {}", path.display()),
            Ok(false) => println!("{} is already covered by a watched folder", path.display()),
            Err(e) => println!("cannot add {}: {}", path.display(), e),
        }
    }
    // The pass itself runs on the next `run`
    coordinator.shutdown().await;
    Ok(())
}

async fn verify(config: Config) -> Result<()> {
    use gencat::GencatError;

    let db = catalog::open(config.db_path(), config.migrations_dir()).await?;
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected = ["folders", "model_instances", "models", "photos", "schema_migrations"];
        let missing: Vec<&str> = expected
            .iter()
            .copied()
            .filter(|table| !tables.iter().any(|t| t == table))
            .collect();
        if !missing.is_empty() {
            return Err(GencatError::Config(format!("Missing tables: {}", missing.join(", "))));
        }
        log::debug!("✓ {} tables present", expected.len());

        let applied = migrate::get_applied_migrations(conn)?;
        log::debug!("✓ {} migrations applied", applied.len());

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            return Err(GencatError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(GencatError::Config(format!("Database integrity check failed: {}", integrity)));
        }
        log::info!("✓ Database integrity: OK");
        Ok(())
    })
    .await?;

    let folders = catalog::folders(&db).await?;
    println!("catalog ok: {} folder(s), {} model(s)", folders.len(), catalog::models(&db).await?.len());
    Ok(())
}
