use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

use super::{check_region_name, ManifestStore};
use crate::error::{Error, Result};
use crate::manifest::Manifest;

const SCHEMA_VERSION: i64 = 1;

/// One row per region; each save replaces the row inside a transaction.
pub struct SqliteManifestStore {
    conn: Connection,
}

fn sql_err(what: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::Store(format!("sqlite {what} failed: {e}"))
}

impl SqliteManifestStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Store(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(sql_err("open"))?;
        Self::init(conn)
    }

    #[cfg(test)]
    fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(sql_err("open"))?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .map_err(sql_err("pragma"))?;

        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);
        if version > SCHEMA_VERSION {
            return Err(Error::CorruptState {
                what: "manifest database",
                location: conn.path().unwrap_or("<memory>").to_string(),
                reason: format!("schema version {version} is newer than {SCHEMA_VERSION}"),
            });
        }

        // Unlike a cache, manifests must survive upgrades: never drop tables here.
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS manifests (
                 region     TEXT PRIMARY KEY,
                 body       TEXT NOT NULL,
                 updated_at TEXT
             );

             PRAGMA user_version = {SCHEMA_VERSION};"
        ))
        .map_err(sql_err("schema init"))?;

        Ok(Self { conn })
    }
}

impl ManifestStore for SqliteManifestStore {
    fn load(&mut self, region: &str) -> Result<Manifest> {
        check_region_name(region)?;
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM manifests WHERE region = ?1",
                params![region],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err("manifest select"))?;

        let Some(body) = body else {
            return Ok(Manifest::default());
        };
        serde_json::from_str(&body).map_err(|e| Error::CorruptState {
            what: "manifest",
            location: format!("manifests.db:{region}"),
            reason: e.to_string(),
        })
    }

    fn save(&mut self, region: &str, manifest: &Manifest) -> Result<()> {
        check_region_name(region)?;
        let body = serde_json::to_string(manifest)
            .map_err(|e| Error::Store(format!("failed to serialize {region} manifest: {e}")))?;

        let tx = self.conn.transaction().map_err(sql_err("transaction"))?;
        tx.execute(
            "INSERT OR REPLACE INTO manifests (region, body, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                region,
                body,
                manifest.updated_at.map(|t| t.to_rfc3339())
            ],
        )
        .map_err(sql_err("manifest upsert"))?;
        tx.commit().map_err(sql_err("commit"))
    }
}
