//! Index store
//!
//! SQLite database holding tracked repositories (roots), the files inside
//! them (leaves), and optional text fragments of those files (leaf pages).
//! FTS5 mirrors of leaves and pages are kept in sync by triggers, so
//! nothing here ever writes to them directly.
//!
//! Every mutating call commits on its own.

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

use crate::inspector::TreeEntry;

/// On-disk schema revision
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS roots (
        id INTEGER PRIMARY KEY,
        root_path TEXT NOT NULL UNIQUE,
        root_hash TEXT,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS leaves (
        id INTEGER PRIMARY KEY,
        root_id INTEGER NOT NULL REFERENCES roots(id) ON DELETE CASCADE,
        leaf_path TEXT NOT NULL,
        leaf_hash TEXT NOT NULL,
        leaf_size INTEGER NOT NULL DEFAULT 0,
        UNIQUE(root_id, leaf_path)
    );

    CREATE TABLE IF NOT EXISTS leaf_pages (
        id INTEGER PRIMARY KEY,
        leaf_id INTEGER NOT NULL REFERENCES leaves(id) ON DELETE CASCADE,
        page_number INTEGER NOT NULL,
        content TEXT NOT NULL,
        UNIQUE(leaf_id, page_number)
    );

    CREATE INDEX IF NOT EXISTS idx_leaf_pages_leaf ON leaf_pages(leaf_id);

    -- FTS5 mirrors
    CREATE VIRTUAL TABLE IF NOT EXISTS leaves_fts USING fts5(
        leaf_path,
        content='leaves',
        content_rowid='id'
    );

    CREATE VIRTUAL TABLE IF NOT EXISTS leaf_pages_fts USING fts5(
        content,
        content='leaf_pages',
        content_rowid='id'
    );

    -- Triggers to keep FTS in sync
    CREATE TRIGGER IF NOT EXISTS leaves_ai AFTER INSERT ON leaves BEGIN
        INSERT INTO leaves_fts(rowid, leaf_path) VALUES (new.id, new.leaf_path);
    END;

    CREATE TRIGGER IF NOT EXISTS leaves_ad AFTER DELETE ON leaves BEGIN
        INSERT INTO leaves_fts(leaves_fts, rowid, leaf_path)
        VALUES ('delete', old.id, old.leaf_path);
    END;

    CREATE TRIGGER IF NOT EXISTS leaves_au AFTER UPDATE ON leaves BEGIN
        INSERT INTO leaves_fts(leaves_fts, rowid, leaf_path)
        VALUES ('delete', old.id, old.leaf_path);
        INSERT INTO leaves_fts(rowid, leaf_path) VALUES (new.id, new.leaf_path);
    END;

    CREATE TRIGGER IF NOT EXISTS leaf_pages_ai AFTER INSERT ON leaf_pages BEGIN
        INSERT INTO leaf_pages_fts(rowid, content) VALUES (new.id, new.content);
    END;

    CREATE TRIGGER IF NOT EXISTS leaf_pages_ad AFTER DELETE ON leaf_pages BEGIN
        INSERT INTO leaf_pages_fts(leaf_pages_fts, rowid, content)
        VALUES ('delete', old.id, old.content);
    END;

    CREATE TRIGGER IF NOT EXISTS leaf_pages_au AFTER UPDATE ON leaf_pages BEGIN
        INSERT INTO leaf_pages_fts(leaf_pages_fts, rowid, content)
        VALUES ('delete', old.id, old.content);
        INSERT INTO leaf_pages_fts(rowid, content) VALUES (new.id, new.content);
    END;
"#;

/// A tracked repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub id: i64,
    pub path: PathBuf,
    /// Last indexed commit; `None` until the first index completes
    pub commit: Option<String>,
    pub updated_at: NaiveDateTime,
}

/// An indexed file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub path: String,
    pub hash: String,
    pub size: u64,
}

pub struct IndexStore {
    conn: Connection,
    path: PathBuf,
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl IndexStore {
    /// Open or create the database, creating parent directories as needed
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        let store = Self {
            conn,
            path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to create schema")?;

        let version = self.schema_version()?;
        match version {
            None => {
                self.conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                bail!(
                    "Database {} has schema version {}, newer than supported version {}",
                    self.path.display(),
                    v,
                    SCHEMA_VERSION
                );
            }
            // Older revisions would be migrated here
            Some(_) => {}
        }
        Ok(())
    }

    /// Stored schema revision, if one has been written
    pub fn schema_version(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?)
    }

    pub fn root(&self, repo: &Path) -> Result<Option<Root>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, root_path, root_hash, updated_at FROM roots WHERE root_path = ?",
                params![key(repo)],
                |row| {
                    Ok(Root {
                        id: row.get(0)?,
                        path: PathBuf::from(row.get::<_, String>(1)?),
                        commit: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()?)
    }

    /// Last indexed commit for a repository
    pub fn root_commit(&self, repo: &Path) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT root_hash FROM roots WHERE root_path = ?",
                params![key(repo)],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    /// Record the indexed commit, creating the root if needed
    pub fn set_root_commit(&self, repo: &Path, commit: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO roots (root_path, root_hash, updated_at)
             VALUES (?1, ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(root_path) DO UPDATE SET
                root_hash = excluded.root_hash,
                updated_at = CURRENT_TIMESTAMP",
            params![key(repo), commit],
        )?;
        Ok(())
    }

    /// Create the root (with no commit) if it does not exist yet
    pub fn ensure_root(&self, repo: &Path) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO roots (root_path) VALUES (?) ON CONFLICT(root_path) DO NOTHING",
            params![key(repo)],
        )?;
        self.root_id(repo)?
            .with_context(|| format!("Root vanished after insert: {}", repo.display()))
    }

    pub fn root_id(&self, repo: &Path) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM roots WHERE root_path = ?",
                params![key(repo)],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Insert a leaf, or overwrite hash and size if the path is already known
    pub fn upsert_leaf(&self, root_id: i64, path: &str, hash: &str, size: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO leaves (root_id, leaf_path, leaf_hash, leaf_size)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(root_id, leaf_path) DO UPDATE SET
                leaf_hash = excluded.leaf_hash,
                leaf_size = excluded.leaf_size",
            params![root_id, path, hash, size as i64],
        )?;
        Ok(())
    }

    /// Update an existing leaf in place. Returns false if there was none.
    pub fn update_leaf(&self, root_id: i64, path: &str, hash: &str, size: u64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE leaves SET leaf_hash = ?1, leaf_size = ?2
             WHERE root_id = ?3 AND leaf_path = ?4",
            params![hash, size as i64, root_id, path],
        )?;
        Ok(changed > 0)
    }

    /// Delete a leaf. Returns false if there was none.
    pub fn remove_leaf(&self, root_id: i64, path: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "DELETE FROM leaves WHERE root_id = ? AND leaf_path = ?",
            params![root_id, path],
        )?;
        Ok(changed > 0)
    }

    /// Make the root's leaves exactly `entries`, atomically
    pub fn replace_leaves(&mut self, root_id: i64, entries: &[TreeEntry]) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM leaves WHERE root_id = ?", params![root_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO leaves (root_id, leaf_path, leaf_hash, leaf_size)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in entries {
                stmt.execute(params![root_id, entry.path, entry.hash, entry.size as i64])
                    .with_context(|| format!("Failed to insert leaf {}", entry.path))?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    /// All leaves of a root, ordered by path
    pub fn leaves(&self, root_id: i64) -> Result<Vec<Leaf>> {
        let mut stmt = self.conn.prepare(
            "SELECT leaf_path, leaf_hash, leaf_size FROM leaves
             WHERE root_id = ? ORDER BY leaf_path",
        )?;
        let leaves = stmt
            .query_map(params![root_id], |row| {
                Ok(Leaf {
                    path: row.get(0)?,
                    hash: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(leaves)
    }
}
