//! Device-local marker-colour overrides.
//!
//! Maps `(owner_id, friend_id)` to a custom colour string.  Stored in a
//! small SQLite database on the device, namespaced by the owning user so two
//! accounts on the same head unit don't see each other's overrides.  Never
//! synced to the backend; survives sign-out.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};

#[derive(Debug)]
pub enum ColorStoreError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for ColorStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColorStoreError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            ColorStoreError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for ColorStoreError {}

impl From<rusqlite::Error> for ColorStoreError {
    fn from(e: rusqlite::Error) -> Self {
        ColorStoreError::Sqlite(e)
    }
}

impl From<std::io::Error> for ColorStoreError {
    fn from(e: std::io::Error) -> Self {
        ColorStoreError::Io(e)
    }
}

pub struct ColorStore {
    conn: Connection,
}

impl ColorStore {
    /// Open (or create) the override database at the given path.
    pub fn open(path: &Path) -> Result<Self, ColorStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, ColorStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), ColorStoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS marker_colors (
                owner_id    TEXT NOT NULL,
                friend_id   TEXT NOT NULL,
                color       TEXT NOT NULL,
                updated_at  INTEGER NOT NULL,
                PRIMARY KEY (owner_id, friend_id)
            );
            ",
        )?;
        Ok(())
    }

    /// Set or replace the override for `(owner_id, friend_id)`.
    pub fn set_override(
        &self,
        owner_id: &str,
        friend_id: &str,
        color: &str,
    ) -> Result<(), ColorStoreError> {
        self.conn.execute(
            "INSERT INTO marker_colors (owner_id, friend_id, color, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (owner_id, friend_id) DO UPDATE
             SET color = excluded.color, updated_at = excluded.updated_at",
            params![owner_id, friend_id, color, crate::store::now_secs() as i64],
        )?;
        Ok(())
    }

    pub fn get_override(
        &self,
        owner_id: &str,
        friend_id: &str,
    ) -> Result<Option<String>, ColorStoreError> {
        let color = self
            .conn
            .query_row(
                "SELECT color FROM marker_colors WHERE owner_id = ?1 AND friend_id = ?2",
                params![owner_id, friend_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(color)
    }

    /// Remove the override; returns false when none existed.
    pub fn clear_override(&self, owner_id: &str, friend_id: &str) -> Result<bool, ColorStoreError> {
        let affected = self.conn.execute(
            "DELETE FROM marker_colors WHERE owner_id = ?1 AND friend_id = ?2",
            params![owner_id, friend_id],
        )?;
        Ok(affected > 0)
    }

    /// All overrides for one owner, as `(friend_id, color)` pairs.
    pub fn list_for_owner(&self, owner_id: &str) -> Result<Vec<(String, String)>, ColorStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT friend_id, color FROM marker_colors
             WHERE owner_id = ?1 ORDER BY friend_id",
        )?;
        let rows = stmt.query_map(params![owner_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// The colour to display for a friend: the local override when present,
    /// else the profile's own marker colour.  A failed lookup degrades to
    /// the profile colour rather than erroring.
    pub fn effective_color(&self, owner_id: &str, friend_id: &str, profile_color: &str) -> String {
        match self.get_override(owner_id, friend_id) {
            Ok(Some(color)) => color,
            Ok(None) => profile_color.to_string(),
            Err(e) => {
                crate::cvlog!(
                    "color store: lookup failed for {}: {}",
                    crate::logging::user_id(friend_id),
                    e
                );
                profile_color.to_string()
            }
        }
    }
}
