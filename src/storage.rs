use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::Quack2TexError;
use crate::menu::node::CaptureMode;

/// One row of the menu tree as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedItem {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub position: i64,
    pub name: String,
    pub icon: String,
    pub system_instruction: Option<String>,
    pub guidance_prompt: Option<String>,
    /// Comma separated model ids.
    pub models: Option<String>,
    pub capture_mode: Option<CaptureMode>,
}

#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub parent_id: Option<i64>,
    pub name: String,
    pub icon: String,
    pub system_instruction: Option<String>,
    pub guidance_prompt: Option<String>,
    pub models: Option<String>,
    pub capture_mode: Option<CaptureMode>,
}

#[derive(Debug, Clone)]
pub struct NewPrompt {
    pub item_id: Option<i64>,
    pub system_instruction: String,
    pub guidance_prompt: String,
    pub capture_mode: CaptureMode,
    pub input: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub id: i64,
    pub prompt_id: i64,
    pub model: String,
    pub output: String,
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct PromptRecord {
    pub id: i64,
    pub created_at: String,
    pub item_id: Option<i64>,
    pub system_instruction: String,
    pub guidance_prompt: String,
    pub capture_mode: String,
    pub input: Vec<u8>,
    pub responses: Vec<ResponseRecord>,
}

/// SQLite-backed menu items and prompt history. Constructed once by the
/// composition root and shared behind an `Arc`.
pub struct Storage {
    conn: Mutex<Connection>,
    max_prompts: u32,
}

const ITEM_COLUMNS: &str =
    "id, parent_id, position, name, icon, system_instruction, guidance_prompt, models, capture_mode";

fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistedItem> {
    let capture: Option<String> = row.get(8)?;
    let id: i64 = row.get(0)?;
    let capture_mode = match capture.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match raw.parse::<CaptureMode>() {
            Ok(mode) => Some(mode),
            Err(e) => {
                warn!("Item {} has an invalid capture mode: {}", id, e);
                None
            }
        },
    };
    Ok(PersistedItem {
        id,
        parent_id: row.get(1)?,
        position: row.get(2)?,
        name: row.get(3)?,
        icon: row.get(4)?,
        system_instruction: row.get(5)?,
        guidance_prompt: row.get(6)?,
        models: row.get(7)?,
        capture_mode,
    })
}

impl Storage {
    pub fn open(db_path: &Path, max_prompts: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data dir: {:?}", parent))?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {:?}", db_path))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER REFERENCES items(id) ON DELETE CASCADE,
                position INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                icon TEXT NOT NULL DEFAULT '',
                system_instruction TEXT,
                guidance_prompt TEXT,
                models TEXT,
                capture_mode TEXT
            );
            CREATE TABLE IF NOT EXISTS prompts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at TEXT NOT NULL,
                item_id INTEGER,
                system_instruction TEXT NOT NULL DEFAULT '',
                guidance_prompt TEXT NOT NULL DEFAULT '',
                capture_mode TEXT NOT NULL,
                input BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS responses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prompt_id INTEGER NOT NULL REFERENCES prompts(id) ON DELETE CASCADE,
                model TEXT NOT NULL,
                output TEXT NOT NULL,
                failed INTEGER NOT NULL DEFAULT 0
            );",
        )?;

        info!("Database opened at {:?}", db_path);
        Ok(Self {
            conn: Mutex::new(conn),
            max_prompts,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Quack2TexError::Storage("connection mutex poisoned".to_string()).into())
    }

    /// Every item, ordered by position then id within the whole table.
    pub fn fetch_tree(&self) -> Result<Vec<PersistedItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM items ORDER BY position, id",
            ITEM_COLUMNS
        ))?;
        let items = stmt
            .query_map([], item_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub fn get_item(&self, id: i64) -> Result<Option<PersistedItem>> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
                params![id],
                item_from_row,
            )
            .optional()?;
        Ok(item)
    }

    /// Appends the item after its existing siblings and returns its id.
    pub fn add_item(&self, item: &NewItem) -> Result<i64> {
        let conn = self.conn()?;
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM items WHERE parent_id IS ?1",
            params![item.parent_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO items (parent_id, position, name, icon, system_instruction, guidance_prompt, models, capture_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.parent_id,
                position,
                item.name,
                item.icon,
                item.system_instruction,
                item.guidance_prompt,
                item.models,
                item.capture_mode.map(|m| m.as_str()),
            ],
        )
        .with_context(|| format!("Failed to add menu item '{}'", item.name))?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_item(&self, item: &PersistedItem) -> Result<()> {
        if item.parent_id == Some(item.id) {
            return Err(Quack2TexError::Storage(format!("item {} cannot be its own parent", item.id)).into());
        }
        let conn = self.conn()?;
        if let Some(parent_id) = item.parent_id {
            let below: bool = conn.query_row(
                "WITH RECURSIVE below(id) AS (
                    SELECT id FROM items WHERE parent_id = ?1
                    UNION
                    SELECT items.id FROM items JOIN below ON items.parent_id = below.id
                 )
                 SELECT EXISTS(SELECT 1 FROM below WHERE id = ?2)",
                params![item.id, parent_id],
                |row| row.get(0),
            )?;
            if below {
                return Err(Quack2TexError::Storage(format!(
                    "item {} cannot move under its own descendant {}",
                    item.id, parent_id
                ))
                .into());
            }
        }
        let changed = conn.execute(
            "UPDATE items SET parent_id = ?2, position = ?3, name = ?4, icon = ?5,
                system_instruction = ?6, guidance_prompt = ?7, models = ?8, capture_mode = ?9
             WHERE id = ?1",
            params![
                item.id,
                item.parent_id,
                item.position,
                item.name,
                item.icon,
                item.system_instruction,
                item.guidance_prompt,
                item.models,
                item.capture_mode.map(|m| m.as_str()),
            ],
        )?;
        if changed == 0 {
            return Err(Quack2TexError::Storage(format!("no menu item with id {}", item.id)).into());
        }
        Ok(())
    }

    /// Deletes the items and all of their descendants. Returns the number of rows removed.
    pub fn delete_items(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            // Cascaded rows are not counted by changes(), so count the subtree first.
            let doomed: i64 = tx.query_row(
                "WITH RECURSIVE doomed(id) AS (
                    SELECT id FROM items WHERE id = ?1
                    UNION
                    SELECT items.id FROM items JOIN doomed ON items.parent_id = doomed.id
                 )
                 SELECT COUNT(*) FROM doomed",
                params![id],
                |row| row.get(0),
            )?;
            tx.execute("DELETE FROM items WHERE id = ?1", params![id])?;
            removed += doomed as usize;
        }
        tx.commit()?;
        info!("Deleted {} menu item(s)", removed);
        Ok(removed)
    }

    /// Stores a prompt without responses; they are attached with [`Storage::add_response`].
    pub fn add_prompt(&self, prompt: &NewPrompt) -> Result<i64> {
        let conn = self.conn()?;
        let prompt_id = insert_prompt(&conn, prompt).context("Failed to add prompt")?;
        self.enforce_retention(&conn)?;
        Ok(prompt_id)
    }

    /// Stores a prompt together with one response per model, in one transaction.
    pub fn record_exchange(&self, prompt: &NewPrompt, responses: &[(String, String, bool)]) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let prompt_id = insert_prompt(&tx, prompt)?;
        for (model, output, failed) in responses {
            tx.execute(
                "INSERT INTO responses (prompt_id, model, output, failed) VALUES (?1, ?2, ?3, ?4)",
                params![prompt_id, model, output, failed],
            )?;
        }
        tx.commit()?;

        self.enforce_retention(&conn)?;
        Ok(prompt_id)
    }

    pub fn add_response(&self, prompt_id: i64, model: &str, output: &str, failed: bool) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO responses (prompt_id, model, output, failed) VALUES (?1, ?2, ?3, ?4)",
            params![prompt_id, model, output, failed],
        )
        .with_context(|| format!("Failed to add response for prompt {}", prompt_id))?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first, each with its responses.
    pub fn list_prompts(&self, limit: u32) -> Result<Vec<PromptRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, item_id, system_instruction, guidance_prompt, capture_mode, input
             FROM prompts ORDER BY id DESC LIMIT ?1",
        )?;
        let mut prompts = stmt
            .query_map(params![limit], |row| {
                Ok(PromptRecord {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    item_id: row.get(2)?,
                    system_instruction: row.get(3)?,
                    guidance_prompt: row.get(4)?,
                    capture_mode: row.get(5)?,
                    input: row.get(6)?,
                    responses: Vec::new(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, prompt_id, model, output, failed FROM responses WHERE prompt_id = ?1 ORDER BY id",
        )?;
        for prompt in prompts.iter_mut() {
            prompt.responses = stmt
                .query_map(params![prompt.id], |row| {
                    Ok(ResponseRecord {
                        id: row.get(0)?,
                        prompt_id: row.get(1)?,
                        model: row.get(2)?,
                        output: row.get(3)?,
                        failed: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
        }
        Ok(prompts)
    }

    /// Removes one prompt and its responses.
    pub fn delete_prompt(&self, prompt_id: i64) -> Result<()> {
        let conn = self.conn()?;
        if conn.execute("DELETE FROM prompts WHERE id = ?1", params![prompt_id])? == 0 {
            return Err(Quack2TexError::Storage(format!("no prompt with id {}", prompt_id)).into());
        }
        Ok(())
    }

    pub fn clear_prompts(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("DELETE FROM responses; DELETE FROM prompts;")?;
        info!("Prompt history cleared");
        Ok(())
    }

    fn enforce_retention(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "DELETE FROM prompts WHERE id NOT IN (SELECT id FROM prompts ORDER BY id DESC LIMIT ?1)",
            params![self.max_prompts],
        )?;
        Ok(())
    }
}

fn insert_prompt(conn: &Connection, prompt: &NewPrompt) -> rusqlite::Result<i64> {
    let created_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    conn.execute(
        "INSERT INTO prompts (created_at, item_id, system_instruction, guidance_prompt, capture_mode, input)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            created_at,
            prompt.item_id,
            prompt.system_instruction,
            prompt.guidance_prompt,
            prompt.capture_mode.as_str(),
            prompt.input,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
