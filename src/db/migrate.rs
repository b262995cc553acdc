//! Ordered SQL migrations loaded from `migrations/NNN_name.sql`.

use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use crate::error::{Result, GencatError};

/// One migration file
#[derive(Debug)]
struct Migration {
    version: u32,
    name: String,
    sql: String,
}

impl Migration {
    /// Parse `001_catalog.sql` into version 1 / name `001_catalog`.
    fn from_path(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| GencatError::Config(format!("Invalid migration filename: {}", path.display())))?;

        let version = filename
            .split('_')
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| GencatError::Config(format!("Invalid migration version: {}", filename)))?;

        Ok(Self {
            version,
            name: filename.trim_end_matches(".sql").to_string(),
            sql: fs::read_to_string(path)?,
        })
    }
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Names of applied migrations, oldest first
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = fs::read_dir(migrations_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("sql"))
        .map(|p| Migration::from_path(&p))
        .collect::<Result<Vec<_>>>()?;

    migrations.sort_by_key(|m| m.version);
    Ok(migrations)
}

/// Apply every migration in `migrations_dir` not yet recorded, each in its own transaction.
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;

    let applied = get_applied_migrations(conn)?;

    for migration in load_migrations(migrations_dir)? {
        if applied.contains(&migration.name) {
            log::debug!("Migration {} already applied, skipping", migration.name);
            continue;
        }

        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }

    Ok(())
}
