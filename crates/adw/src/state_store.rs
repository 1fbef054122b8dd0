//! Run State Store (C2).
//!
//! Persists one [`adw_types::RunStateDocument`] per run at
//! `agents/<run_id>/state.json`, written with a tmp-file-then-rename-then-
//! fsync-parent-dir discipline so a crash mid-write never leaves a torn file
//! behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use adw_types::RunStateDocument;

use crate::error::StateStoreError;

pub const STATE_FILE: &str = "state.json";
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub struct RunStateStore {
    agents_dir: PathBuf,
}

impl RunStateStore {
    pub fn new(agents_dir: PathBuf) -> Self {
        Self { agents_dir }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.agents_dir.join(run_id)
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    pub fn load(&self, run_id: &str) -> Result<Option<RunStateDocument>, StateStoreError> {
        let path = self.state_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;

        if let Some(found) = value.get("schema_version").and_then(|v| v.as_u64()) {
            let found = found as u32;
            if found > CURRENT_SCHEMA_VERSION {
                return Err(StateStoreError::SchemaTooNew {
                    found,
                    supported: CURRENT_SCHEMA_VERSION,
                });
            }
        }

        let doc: RunStateDocument = serde_json::from_value(value)?;
        Ok(Some(doc))
    }

    pub fn require(&self, run_id: &str) -> Result<RunStateDocument, StateStoreError> {
        self.load(run_id)?
            .ok_or_else(|| StateStoreError::NotFound(run_id.to_string()))
    }

    pub fn save(&self, run_id: &str, doc: &RunStateDocument) -> Result<(), StateStoreError> {
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir)?;

        let path = self.state_path(run_id);
        let mut envelope = serde_json::to_value(doc)?;
        if let Some(obj) = envelope.as_object_mut() {
            obj.insert(
                "schema_version".to_string(),
                serde_json::json!(CURRENT_SCHEMA_VERSION),
            );
        }
        atomic_write_json(&path, &envelope)
    }

    /// Mutate the stored document in place, re-saving atomically. Fails if
    /// no document has been saved yet for this run.
    pub fn update<F>(&self, run_id: &str, f: F) -> Result<RunStateDocument, StateStoreError>
    where
        F: FnOnce(&mut RunStateDocument),
    {
        let mut doc = self.require(run_id)?;
        f(&mut doc);
        self.save(run_id, &doc)?;
        Ok(doc)
    }

    pub fn delete(&self, run_id: &str) -> Result<(), StateStoreError> {
        let path = self.state_path(run_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StateStoreError> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)?;

    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&data)?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path)?;
    fsync_parent_dir(path);
    Ok(())
}

fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}
