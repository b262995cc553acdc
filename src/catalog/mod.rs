//! Catalog reads and writes over the SQLite database.
//!
//! Every operation runs in its own short connection via [`Db::with_connection`].
//! Photo deletes and renames maintain `model_instances` explicitly; unused
//! models are removed by [`sweep_unused_models`], never by cascade.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, MAIN_SEPARATOR};

use crate::db::Db;
use crate::error::{GencatError, Result};
use crate::paths::{is_under_ignore_case, replace_prefix};
use crate::types::{Folder, GenerationParameters, LinkedModel, Model, ModelKind, Photo};

/// Everything a scan pass commits at once
#[derive(Debug, Default)]
pub struct ScanBatch {
    /// Newly ingested photos, with their linked models
    pub photos: Vec<Photo>,
    /// Catalogued paths no longer on disk
    pub deleted: Vec<String>,
}

/// What a scan commit changed, for event emission
#[derive(Debug, Default, PartialEq)]
pub struct ScanCommit {
    pub inserted_models: Vec<Model>,
    pub deleted_photos: Vec<String>,
    pub removed_models: Vec<Model>,
}

/// Paths rewritten by a prefix rename
#[derive(Debug, Default, PartialEq)]
pub struct PrefixRename {
    pub photos: Vec<(String, String)>,
    pub folders: Vec<(String, String)>,
}

const PHOTO_COLUMNS: &str = "path, name, created_at, modified_at, file_size, width, height, \
                             raw_metadata, parameters_json, extra_json, thumbnail";

/// Photo row before JSON and timestamp decoding
struct PhotoRow {
    path: String,
    name: String,
    created_at: String,
    modified_at: String,
    file_size: i64,
    width: i64,
    height: i64,
    raw_metadata: Option<String>,
    parameters_json: String,
    extra_json: String,
    thumbnail: Vec<u8>,
}

fn read_photo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PhotoRow> {
    Ok(PhotoRow {
        path: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        modified_at: row.get(3)?,
        file_size: row.get(4)?,
        width: row.get(5)?,
        height: row.get(6)?,
        raw_metadata: row.get(7)?,
        parameters_json: row.get(8)?,
        extra_json: row.get(9)?,
        thumbnail: row.get(10)?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GencatError::InvalidInput(format!("bad timestamp '{}': {}", value, e)))
}

impl PhotoRow {
    fn into_photo(self, models: Vec<LinkedModel>) -> Result<Photo> {
        let parameters: GenerationParameters = serde_json::from_str(&self.parameters_json)?;
        let extra: BTreeMap<String, String> = serde_json::from_str(&self.extra_json)?;
        Ok(Photo {
            created_at: parse_timestamp(&self.created_at)?,
            modified_at: parse_timestamp(&self.modified_at)?,
            path: self.path,
            name: self.name,
            file_size: self.file_size.max(0) as u64,
            width: self.width.max(0) as u32,
            height: self.height.max(0) as u32,
            raw_metadata: self.raw_metadata,
            parameters,
            extra,
            thumbnail: self.thumbnail,
            models,
        })
    }
}

fn read_model_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Model> {
    let kind: String = row.get(offset + 4)?;
    Ok(Model {
        version_id: row.get(offset)?,
        name: row.get(offset + 1)?,
        version_name: row.get(offset + 2)?,
        model_id: row.get(offset + 3)?,
        kind: kind.parse().unwrap_or(ModelKind::Unknown),
    })
}

const LINK_QUERY: &str = "SELECT mi.photo_path, mi.weight, \
                          m.version_id, m.name, m.version_name, m.model_id, m.kind \
                          FROM model_instances mi JOIN models m ON m.version_id = mi.version_id";

/// Bounds selecting a path and everything beneath it with an index range
/// scan: `prefix` itself, or `prefix/ <= path < prefix0` (`0` sorts right
/// after `/`).
struct Subtree {
    exact: String,
    lower: String,
    upper: String,
}

impl Subtree {
    fn new(prefix: &str) -> Self {
        let exact = prefix.trim_end_matches(['/', MAIN_SEPARATOR]).to_string();
        let next = (MAIN_SEPARATOR as u8 + 1) as char;
        Self {
            lower: format!("{}{}", exact, MAIN_SEPARATOR),
            upper: format!("{}{}", exact, next),
            exact,
        }
    }

    /// `WHERE` condition on `column`, bound to `?1..?3`.
    fn clause(column: &str) -> String {
        format!("({c} = ?1 OR ({c} >= ?2 AND {c} < ?3))", c = column)
    }

    fn params(&self) -> [&dyn ToSql; 3] {
        [&self.exact, &self.lower, &self.upper]
    }
}

/// Linked models of the photos matching `filter`, keyed by photo path.
fn load_links(conn: &Connection, filter: &str, args: &[&dyn ToSql]) -> Result<HashMap<String, Vec<LinkedModel>>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE {} ORDER BY mi.photo_path, m.version_id",
        LINK_QUERY, filter
    ))?;
    let rows = stmt.query_map(args, |row| {
        let path: String = row.get(0)?;
        let weight: Option<f64> = row.get(1)?;
        Ok((path, LinkedModel { model: read_model_row(row, 2)?, weight }))
    })?;

    let mut links: HashMap<String, Vec<LinkedModel>> = HashMap::new();
    for row in rows {
        let (path, link) = row?;
        links.entry(path).or_default().push(link);
    }
    Ok(links)
}

fn photo_paths_in(conn: &Connection, subtree: &Subtree) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT path FROM photos WHERE {} ORDER BY path",
        Subtree::clause("path")
    ))?;
    let paths = stmt
        .query_map(&subtree.params()[..], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(paths)
}

/// `LIKE` pattern for everything strictly beneath `prefix`, escaped with `\`.
fn like_beneath(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 2);
    for c in prefix.chars().chain(std::iter::once(MAIN_SEPARATOR)) {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn model_exists(conn: &Connection, version_id: i64) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM models WHERE version_id = ?1", params![version_id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn insert_model_row(conn: &Connection, model: &Model) -> Result<bool> {
    if model_exists(conn, model.version_id)? {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO models (version_id, name, version_name, model_id, kind) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![model.version_id, model.name, model.version_name, model.model_id, model.kind.as_str()],
    )?;
    Ok(true)
}

/// Upsert one photo row and replace its model links.
///
/// Returns the models that were not yet in the catalog.
fn write_photo(conn: &Connection, photo: &Photo) -> Result<Vec<Model>> {
    let parameters_json = serde_json::to_string(&photo.parameters)?;
    let extra_json = serde_json::to_string(&photo.extra)?;
    let p = &photo.parameters;

    conn.execute(
        r#"
        INSERT INTO photos (
            path, name, created_at, modified_at, file_size, width, height,
            raw_metadata, prompt, negative_prompt, steps, sampler, cfg_scale, seed,
            parameters_json, extra_json, thumbnail
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
        ON CONFLICT(path) DO UPDATE SET
            name = excluded.name,
            created_at = excluded.created_at,
            modified_at = excluded.modified_at,
            file_size = excluded.file_size,
            width = excluded.width,
            height = excluded.height,
            raw_metadata = excluded.raw_metadata,
            prompt = excluded.prompt,
            negative_prompt = excluded.negative_prompt,
            steps = excluded.steps,
            sampler = excluded.sampler,
            cfg_scale = excluded.cfg_scale,
            seed = excluded.seed,
            parameters_json = excluded.parameters_json,
            extra_json = excluded.extra_json,
            thumbnail = excluded.thumbnail
        "#,
        params![
            photo.path,
            photo.name,
            photo.created_at.to_rfc3339(),
            photo.modified_at.to_rfc3339(),
            photo.file_size as i64,
            photo.width as i64,
            photo.height as i64,
            photo.raw_metadata,
            p.prompt,
            p.negative_prompt,
            p.steps,
            p.sampler,
            p.cfg_scale,
            p.seed,
            parameters_json,
            extra_json,
            photo.thumbnail,
        ],
    )?;

    conn.execute("DELETE FROM model_instances WHERE photo_path = ?1", params![photo.path])?;

    let mut inserted = Vec::new();
    for link in &photo.models {
        if insert_model_row(conn, &link.model)? {
            inserted.push(link.model.clone());
        }
        conn.execute(
            "INSERT OR REPLACE INTO model_instances (photo_path, version_id, weight) VALUES (?1, ?2, ?3)",
            params![photo.path, link.model.version_id, link.weight],
        )?;
    }
    Ok(inserted)
}

fn delete_photo_row(conn: &Connection, path: &str) -> Result<bool> {
    conn.execute("DELETE FROM model_instances WHERE photo_path = ?1", params![path])?;
    let removed = conn.execute("DELETE FROM photos WHERE path = ?1", params![path])?;
    Ok(removed > 0)
}

fn rename_photo_row(conn: &Connection, old: &str, new: &str) -> Result<bool> {
    if old == new {
        return Ok(false);
    }
    // A file renamed over an existing one replaces it
    delete_photo_row(conn, new)?;
    let updated = conn.execute(
        "UPDATE photos SET path = ?2, name = ?3 WHERE path = ?1",
        params![old, new, file_name(new)],
    )?;
    conn.execute(
        "UPDATE model_instances SET photo_path = ?2 WHERE photo_path = ?1",
        params![old, new],
    )?;
    Ok(updated > 0)
}

/// Two-phase sweep: collect models no photo links to, then delete them.
fn sweep(conn: &Connection) -> Result<Vec<Model>> {
    let unused = {
        let mut stmt = conn.prepare(
            "SELECT version_id, name, version_name, model_id, kind FROM models \
             WHERE version_id NOT IN (SELECT DISTINCT version_id FROM model_instances) \
             ORDER BY version_id",
        )?;
        let rows = stmt.query_map([], |row| read_model_row(row, 0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    for model in &unused {
        conn.execute("DELETE FROM models WHERE version_id = ?1", params![model.version_id])?;
    }
    Ok(unused)
}

fn with_transaction<T>(conn: &mut Connection, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Insert the photo, or update it in place when the path is already catalogued.
///
/// Returns the linked models that were new to the catalog.
pub async fn upsert_photo(db: &Db, photo: Photo) -> Result<Vec<Model>> {
    db.with_connection(move |conn| with_transaction(conn, |tx| write_photo(tx, &photo)))
        .await
}

/// Fetch one photo with its linked models.
pub async fn get_photo(db: &Db, path: &str) -> Result<Option<Photo>> {
    let path = path.to_string();
    db.with_connection(move |conn| {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM photos WHERE path = ?1", PHOTO_COLUMNS),
                params![path],
                read_photo_row,
            )
            .optional()?;
        match row {
            Some(row) => {
                let mut links = load_links(conn, "mi.photo_path = ?1", params![path])?;
                let models = links.remove(&path).unwrap_or_default();
                Ok(Some(row.into_photo(models)?))
            }
            None => Ok(None),
        }
    })
    .await
}

/// Photos at or below `prefix`, models eager-loaded, ordered by path.
pub async fn photos_under(db: &Db, prefix: &str) -> Result<Vec<Photo>> {
    let prefix = prefix.to_string();
    db.with_connection(move |conn| {
        let subtree = Subtree::new(&prefix);
        let rows = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM photos WHERE {} ORDER BY path",
                PHOTO_COLUMNS,
                Subtree::clause("path")
            ))?;
            let rows = stmt.query_map(&subtree.params()[..], read_photo_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut links = load_links(conn, &Subtree::clause("mi.photo_path"), &subtree.params())?;
        rows.into_iter()
            .map(|row| {
                let models = links.remove(&row.path).unwrap_or_default();
                row.into_photo(models)
            })
            .collect()
    })
    .await
}

/// Catalogued photo paths at or below `prefix`.
pub async fn photo_paths_under(db: &Db, prefix: &str) -> Result<HashSet<String>> {
    let prefix = prefix.to_string();
    db.with_connection(move |conn| Ok(photo_paths_in(conn, &Subtree::new(&prefix))?.into_iter().collect()))
        .await
}

/// Delete one photo and its links. Returns whether a row existed.
pub async fn delete_photo(db: &Db, path: &str) -> Result<bool> {
    let path = path.to_string();
    db.with_connection(move |conn| with_transaction(conn, |tx| delete_photo_row(tx, &path)))
        .await
}

/// Delete every photo at or below `prefix`. Returns the deleted paths.
pub async fn delete_photos_under(db: &Db, prefix: &str) -> Result<Vec<String>> {
    let prefix = prefix.to_string();
    db.with_connection(move |conn| {
        with_transaction(conn, |tx| {
            let doomed = photo_paths_in(tx, &Subtree::new(&prefix))?;
            for path in &doomed {
                delete_photo_row(tx, path)?;
            }
            Ok(doomed)
        })
    })
    .await
}

/// Move a photo to a new path without re-parsing it.
///
/// Returns the renamed photo, or `None` when `old` was not catalogued.
pub async fn rename_photo(db: &Db, old: &str, new: &str) -> Result<Option<Photo>> {
    let (old_owned, new_owned) = (old.to_string(), new.to_string());
    let renamed = db
        .with_connection(move |conn| with_transaction(conn, |tx| rename_photo_row(tx, &old_owned, &new_owned)))
        .await?;
    if !renamed {
        return Ok(None);
    }
    get_photo(db, new).await
}

/// Rewrite every photo and folder path under `old` to live under `new`.
///
/// Matching is case-insensitive and separator-aware. SQLite folds ASCII
/// only, so the candidates it selects are confirmed by [`replace_prefix`].
pub async fn rename_prefix(db: &Db, old: &str, new: &str) -> Result<PrefixRename> {
    let (old, new) = (old.to_string(), new.to_string());
    db.with_connection(move |conn| {
        with_transaction(conn, |tx| {
            let mut outcome = PrefixRename::default();

            let exact = old.trim_end_matches(['/', MAIN_SEPARATOR]);
            let photo_paths = {
                let mut stmt = tx.prepare(
                    "SELECT path FROM photos \
                     WHERE path = ?1 COLLATE NOCASE OR path LIKE ?2 ESCAPE '\\' \
                     ORDER BY path",
                )?;
                let rows = stmt.query_map(params![exact, like_beneath(exact)], |row| row.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            for path in photo_paths {
                if let Some(renamed) = replace_prefix(&path, &old, &new) {
                    if rename_photo_row(tx, &path, &renamed)? {
                        outcome.photos.push((path, renamed));
                    }
                }
            }

            for folder in folder_rows(tx)? {
                if let Some(renamed) = replace_prefix(&folder.path, &old, &new) {
                    if rename_folder_row(tx, &folder.path, &renamed)? {
                        outcome.folders.push((folder.path, renamed));
                    }
                }
            }

            Ok(outcome)
        })
    })
    .await
}

fn folder_rows(conn: &Connection) -> Result<Vec<Folder>> {
    let mut stmt = conn.prepare("SELECT path FROM folders ORDER BY path")?;
    let folders = stmt
        .query_map([], |row| Ok(Folder { path: row.get(0)? }))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(folders)
}

fn rename_folder_row(conn: &Connection, old: &str, new: &str) -> Result<bool> {
    if old == new {
        return Ok(false);
    }
    conn.execute("DELETE FROM folders WHERE path = ?1", params![new])?;
    let updated = conn.execute("UPDATE folders SET path = ?2 WHERE path = ?1", params![old, new])?;
    Ok(updated > 0)
}

/// All watched roots, ordered by path.
pub async fn folders(db: &Db) -> Result<Vec<Folder>> {
    db.with_connection(|conn| folder_rows(conn)).await
}

/// Returns `false` when the folder was already present.
pub async fn insert_folder(db: &Db, path: &str) -> Result<bool> {
    let path = path.to_string();
    db.with_connection(move |conn| {
        let inserted = conn.execute("INSERT OR IGNORE INTO folders (path) VALUES (?1)", params![path])?;
        Ok(inserted > 0)
    })
    .await
}

pub async fn remove_folder(db: &Db, path: &str) -> Result<bool> {
    let path = path.to_string();
    db.with_connection(move |conn| {
        let removed = conn.execute("DELETE FROM folders WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    })
    .await
}

pub async fn rename_folder(db: &Db, old: &str, new: &str) -> Result<bool> {
    let (old, new) = (old.to_string(), new.to_string());
    db.with_connection(move |conn| with_transaction(conn, |tx| rename_folder_row(tx, &old, &new)))
        .await
}

/// Insert a model unless its version id is already catalogued.
pub async fn insert_model_if_absent(db: &Db, model: Model) -> Result<bool> {
    db.with_connection(move |conn| insert_model_row(conn, &model)).await
}

pub async fn models(db: &Db) -> Result<Vec<Model>> {
    db.with_connection(|conn| {
        let mut stmt =
            conn.prepare("SELECT version_id, name, version_name, model_id, kind FROM models ORDER BY version_id")?;
        let models = stmt
            .query_map([], |row| read_model_row(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(models)
    })
    .await
}

/// Version ids of every catalogued model.
pub async fn model_ids(db: &Db) -> Result<HashSet<i64>> {
    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT version_id FROM models")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ids)
    })
    .await
}

/// Remove models no photo links to. Returns the removed models.
pub async fn sweep_unused_models(db: &Db) -> Result<Vec<Model>> {
    db.with_connection(|conn| with_transaction(conn, |tx| sweep(tx))).await
}

/// Apply one scan pass in a single transaction: upsert ingested photos,
/// delete vanished ones, then sweep models left without photos.
pub async fn commit_scan(db: &Db, batch: ScanBatch) -> Result<ScanCommit> {
    db.with_connection(move |conn| {
        with_transaction(conn, |tx| {
            let mut commit = ScanCommit::default();
            for photo in &batch.photos {
                commit.inserted_models.extend(write_photo(tx, photo)?);
            }
            for path in &batch.deleted {
                if delete_photo_row(tx, path)? {
                    commit.deleted_photos.push(path.clone());
                }
            }
            commit.removed_models = sweep(tx)?;
            Ok(commit)
        })
    })
    .await
}

/// Open the catalog at `db_path` and bring its schema up to date.
pub async fn open(db_path: &Path, migrations_dir: &Path) -> Result<Db> {
    let db = Db::new(db_path);
    let migrations_dir = migrations_dir.to_path_buf();
    db.with_connection(move |conn| crate::db::migrate::run_migrations(conn, &migrations_dir))
        .await?;
    Ok(db)
}

/// The root in `roots` covering `path`, compared case-insensitively.
pub fn covering_root<'a>(roots: &'a [Folder], path: &str) -> Option<&'a Folder> {
    roots.iter().find(|f| is_under_ignore_case(path, &f.path))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    pub(crate) async fn setup_test_db() -> (Db, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let db = open(&temp_dir.path().join("test.db"), &migrations_dir).await.unwrap();
        (db, temp_dir)
    }

    pub(crate) fn model(version_id: i64, kind: ModelKind) -> Model {
        Model {
            version_id,
            name: format!("model-{}", version_id),
            version_name: format!("v{}", version_id),
            model_id: version_id * 10,
            kind,
        }
    }

    pub(crate) fn photo(path: &str, models: Vec<LinkedModel>) -> Photo {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut extra = BTreeMap::new();
        extra.insert("foo".to_string(), "Bar".to_string());
        Photo {
            path: path.to_string(),
            name: file_name(path),
            created_at: ts,
            modified_at: ts,
            file_size: 1234,
            width: 512,
            height: 768,
            raw_metadata: Some("a cat\nSteps: 20".to_string()),
            parameters: GenerationParameters {
                prompt: Some("a cat".to_string()),
                steps: Some(20),
                ..Default::default()
            },
            extra,
            thumbnail: vec![1, 2, 3],
            models,
        }
    }

    fn link(model: Model, weight: Option<f64>) -> LinkedModel {
        LinkedModel { model, weight }
    }

    #[tokio::test]
    async fn test_upsert_and_get_photo() {
        let (db, _temp) = setup_test_db().await;
        let ckpt = model(1, ModelKind::Checkpoint);
        let lora = model(2, ModelKind::Lora);

        let inserted = upsert_photo(&db, photo("/r/a.png", vec![link(ckpt.clone(), None), link(lora, Some(0.7))]))
            .await
            .unwrap();
        assert_eq!(inserted.len(), 2);

        let stored = get_photo(&db, "/r/a.png").await.unwrap().unwrap();
        assert_eq!(stored, photo("/r/a.png", stored.models.clone()));
        assert_eq!(stored.models.len(), 2);
        assert_eq!(stored.models[1].weight, Some(0.7));

        // Second upsert updates in place and reuses the known models
        let inserted = upsert_photo(&db, photo("/r/a.png", vec![link(ckpt, None)])).await.unwrap();
        assert!(inserted.is_empty());
        let stored = get_photo(&db, "/r/a.png").await.unwrap().unwrap();
        assert_eq!(stored.models.len(), 1);
        assert_eq!(photo_paths_under(&db, "/r").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_prefix_queries_respect_separators() {
        let (db, _temp) = setup_test_db().await;
        for path in ["/a/b/1.png", "/a/b/c/2.png", "/a/bc/3.png"] {
            upsert_photo(&db, photo(path, vec![])).await.unwrap();
        }

        let under: HashSet<String> = photo_paths_under(&db, "/a/b").await.unwrap();
        assert_eq!(under.len(), 2);
        assert!(!under.contains("/a/bc/3.png"));

        let photos = photos_under(&db, "/a/b/").await.unwrap();
        assert_eq!(photos.len(), 2);
        assert_eq!(photos[0].path, "/a/b/1.png");

        let deleted = delete_photos_under(&db, "/a/b").await.unwrap();
        assert_eq!(deleted, vec!["/a/b/1.png".to_string(), "/a/b/c/2.png".to_string()]);
        assert!(get_photo(&db, "/a/bc/3.png").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_subtree_links_stay_scoped() {
        let (db, _temp) = setup_test_db().await;
        upsert_photo(&db, photo("/a/b/1.png", vec![link(model(1, ModelKind::Checkpoint), None)]))
            .await
            .unwrap();
        upsert_photo(&db, photo("/a/b0/2.png", vec![link(model(2, ModelKind::Lora), Some(0.5))]))
            .await
            .unwrap();

        let photos = photos_under(&db, "/a/b").await.unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].models.len(), 1);
        assert_eq!(photos[0].models[0].model.version_id, 1);

        let stored = get_photo(&db, "/a/b0/2.png").await.unwrap().unwrap();
        assert_eq!(stored.models.len(), 1);
        assert_eq!(stored.models[0].model.version_id, 2);

        assert_eq!(photo_paths_under(&db, "/").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rename_prefix_treats_wildcards_literally() {
        let (db, _temp) = setup_test_db().await;
        upsert_photo(&db, photo("/a/b_x/1.png", vec![])).await.unwrap();
        upsert_photo(&db, photo("/a/bzx/2.png", vec![])).await.unwrap();
        upsert_photo(&db, photo("/a/b%/3.png", vec![])).await.unwrap();

        let outcome = rename_prefix(&db, "/a/b_x", "/a/renamed").await.unwrap();
        assert_eq!(outcome.photos, vec![("/a/b_x/1.png".to_string(), "/a/renamed/1.png".to_string())]);
        assert!(get_photo(&db, "/a/bzx/2.png").await.unwrap().is_some());

        let outcome = rename_prefix(&db, "/a/b%", "/a/pct").await.unwrap();
        assert_eq!(outcome.photos.len(), 1);
        assert!(get_photo(&db, "/a/pct/3.png").await.unwrap().is_some());
        assert!(get_photo(&db, "/a/bzx/2.png").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rename_photo_keeps_links() {
        let (db, _temp) = setup_test_db().await;
        upsert_photo(&db, photo("/r/old.png", vec![link(model(5, ModelKind::Checkpoint), None)]))
            .await
            .unwrap();

        let renamed = rename_photo(&db, "/r/old.png", "/r/new.png").await.unwrap().unwrap();
        assert_eq!(renamed.name, "new.png");
        assert_eq!(renamed.models.len(), 1);
        assert!(get_photo(&db, "/r/old.png").await.unwrap().is_none());
        assert!(sweep_unused_models(&db).await.unwrap().is_empty());

        assert!(rename_photo(&db, "/r/missing.png", "/r/x.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_prefix_case_insensitive() {
        let (db, _temp) = setup_test_db().await;
        upsert_photo(&db, photo("/a/B/1.png", vec![])).await.unwrap();
        upsert_photo(&db, photo("/a/b/sub/2.png", vec![])).await.unwrap();
        upsert_photo(&db, photo("/a/bc/3.png", vec![])).await.unwrap();
        insert_folder(&db, "/a/b").await.unwrap();

        let outcome = rename_prefix(&db, "/a/b", "/a/c").await.unwrap();
        assert_eq!(outcome.photos.len(), 2);
        assert_eq!(outcome.folders, vec![("/a/b".to_string(), "/a/c".to_string())]);

        let paths = photo_paths_under(&db, "/a/c").await.unwrap();
        assert!(paths.contains("/a/c/1.png"));
        assert!(paths.contains("/a/c/sub/2.png"));
        assert!(get_photo(&db, "/a/bc/3.png").await.unwrap().is_some());
        assert_eq!(folders(&db).await.unwrap(), vec![Folder { path: "/a/c".to_string() }]);
    }

    #[tokio::test]
    async fn test_folder_rows() {
        let (db, _temp) = setup_test_db().await;
        assert!(insert_folder(&db, "/x").await.unwrap());
        assert!(!insert_folder(&db, "/x").await.unwrap());
        assert!(rename_folder(&db, "/x", "/y").await.unwrap());
        assert!(remove_folder(&db, "/y").await.unwrap());
        assert!(!remove_folder(&db, "/y").await.unwrap());
        assert!(folders(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_only_unused_models() {
        let (db, _temp) = setup_test_db().await;
        let used = model(1, ModelKind::Checkpoint);
        let unused = model(2, ModelKind::Vae);
        upsert_photo(&db, photo("/r/a.png", vec![link(used.clone(), None)])).await.unwrap();
        assert!(insert_model_if_absent(&db, unused.clone()).await.unwrap());
        assert!(!insert_model_if_absent(&db, unused.clone()).await.unwrap());

        let removed = sweep_unused_models(&db).await.unwrap();
        assert_eq!(removed, vec![unused]);
        assert_eq!(models(&db).await.unwrap(), vec![used]);

        assert!(delete_photo(&db, "/r/a.png").await.unwrap());
        assert_eq!(sweep_unused_models(&db).await.unwrap().len(), 1);
        assert!(model_ids(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_scan_is_one_batch() {
        let (db, _temp) = setup_test_db().await;
        upsert_photo(&db, photo("/r/gone.png", vec![link(model(9, ModelKind::Lora), Some(1.0))]))
            .await
            .unwrap();

        let commit = commit_scan(
            &db,
            ScanBatch {
                photos: vec![photo("/r/new.png", vec![link(model(1, ModelKind::Checkpoint), None)])],
                deleted: vec!["/r/gone.png".to_string()],
            },
        )
        .await
        .unwrap();

        assert_eq!(commit.inserted_models, vec![model(1, ModelKind::Checkpoint)]);
        assert_eq!(commit.deleted_photos, vec!["/r/gone.png".to_string()]);
        assert_eq!(commit.removed_models, vec![model(9, ModelKind::Lora)]);
        assert_eq!(model_ids(&db).await.unwrap(), HashSet::from([1]));
    }

    #[test]
    fn test_like_beneath_escapes() {
        assert_eq!(like_beneath("/a/b_c%"), format!("/a/b\\_c\\%{}%", MAIN_SEPARATOR));
    }

    #[test]
    fn test_covering_root() {
        let roots = vec![Folder { path: "/a".to_string() }];
        assert!(covering_root(&roots, "/A/b").is_some());
        assert!(covering_root(&roots, "/ab").is_none());
    }
}
