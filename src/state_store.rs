//! Persistence of armed flags across restarts.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};

use crate::camera::{CameraId, SharedState};

/// Armed flags as stored. Anything absent keeps its configured default.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArmedState {
    pub system: Option<bool>,
    pub cameras: BTreeMap<CameraId, bool>,
}

impl ArmedState {
    /// Snapshot the live flags.
    pub fn capture(state: &SharedState) -> Self {
        Self {
            system: Some(state.system().is_armed()),
            cameras: state
                .cameras()
                .iter()
                .map(|camera| (camera.id(), camera.is_armed()))
                .collect(),
        }
    }

    /// Apply stored flags onto live state. Unknown camera ids are ignored.
    pub fn apply(&self, state: &SharedState) {
        if let Some(armed) = self.system {
            state.system().set_armed(armed);
        }
        for (id, armed) in &self.cameras {
            match state.camera(*id) {
                Some(camera) => camera.set_armed(*armed),
                None => log::debug!("state: ignoring stored flag for unknown camera {id}"),
            }
        }
    }
}

pub trait StateStore: Send {
    fn load_state(&mut self) -> Result<ArmedState>;

    fn save_state(&mut self, state: &ArmedState) -> Result<()>;
}

pub struct SqliteStateStore {
    conn: Connection,
}

impl SqliteStateStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open state db {}", db_path.display()))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS armed_state (
              stream_id INTEGER PRIMARY KEY,
              armed INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn load_state(&mut self) -> Result<ArmedState> {
        let mut stmt = self
            .conn
            .prepare("SELECT stream_id, armed FROM armed_state ORDER BY stream_id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? != 0))
        })?;
        let mut state = ArmedState::default();
        for row in rows {
            let (id, armed) = row?;
            let id = u32::try_from(id).map_err(|_| anyhow!("corrupt armed_state row: id {id}"))?;
            if id == CameraId::SYSTEM.0 {
                state.system = Some(armed);
            } else {
                state.cameras.insert(CameraId(id), armed);
            }
        }
        Ok(state)
    }

    fn save_state(&mut self, state: &ArmedState) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO armed_state (stream_id, armed) VALUES (?1, ?2)
                 ON CONFLICT(stream_id) DO UPDATE SET armed = excluded.armed",
            )?;
            if let Some(armed) = state.system {
                upsert.execute(params![i64::from(CameraId::SYSTEM.0), armed as i64])?;
            }
            for (id, armed) in &state.cameras {
                upsert.execute(params![i64::from(id.0), *armed as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

/// Volatile store for tests and for running without a database.
#[derive(Default)]
pub struct InMemoryStateStore {
    state: Mutex<ArmedState>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn load_state(&mut self) -> Result<ArmedState> {
        self.state
            .lock()
            .map(|s| s.clone())
            .map_err(|_| anyhow!("state lock poisoned"))
    }

    fn save_state(&mut self, state: &ArmedState) -> Result<()> {
        let mut stored = self.state.lock().map_err(|_| anyhow!("state lock poisoned"))?;
        if state.system.is_some() {
            stored.system = state.system;
        }
        stored
            .cameras
            .extend(state.cameras.iter().map(|(id, armed)| (*id, *armed)));
        Ok(())
    }
}
