//! Resource Allocator (C1).
//!
//! Hands out a `(backend_port, frontend_port)` pair and a worktree directory
//! to each run, persisting the allocation table atomically so a crashed
//! process can recover the pool on restart. The atomic-write discipline is
//! shared with the Run State Store.
//!
//! `allocate`/`release` are a single serialized critical section: an
//! in-process `Mutex` excludes the pool's other `spawn_blocking` workers in
//! this process, and [`crate::lock::PortAllocationLock`] excludes any other
//! process sharing the same `agents_dir` (e.g. a `plan` invocation running
//! alongside `serve`). Without both, two concurrent callers can each load
//! the table before either saves and double-assign the same port pair.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AllocatorError;
use crate::lock::PortAllocationLock;
use adw_types::{FRONTEND_PORT_RANGE, BACKEND_PORT_RANGE, RunId};

pub const PORT_ALLOCATIONS_FILE: &str = "port_allocations.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortAllocation {
    pub run_id: RunId,
    pub backend_port: u16,
    pub frontend_port: u16,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PortAllocationTable {
    allocations: BTreeMap<RunId, PortAllocation>,
}

/// Allocates backend/frontend port pairs and worktree directories to runs,
/// backed by a JSON table at `agents/port_allocations.json`.
pub struct ResourceAllocator {
    agents_dir: PathBuf,
    worktree_base: PathBuf,
    backend_range: std::ops::RangeInclusive<u16>,
    frontend_range: std::ops::RangeInclusive<u16>,
    critical_section: Mutex<()>,
}

impl ResourceAllocator {
    pub fn new(agents_dir: PathBuf, worktree_base: PathBuf) -> Self {
        Self {
            agents_dir,
            worktree_base,
            backend_range: BACKEND_PORT_RANGE,
            frontend_range: FRONTEND_PORT_RANGE,
            critical_section: Mutex::new(()),
        }
    }

    pub fn with_port_ranges(
        mut self,
        backend_range: std::ops::RangeInclusive<u16>,
        frontend_range: std::ops::RangeInclusive<u16>,
    ) -> Self {
        self.backend_range = backend_range;
        self.frontend_range = frontend_range;
        self
    }

    fn allocations_path(&self) -> PathBuf {
        self.agents_dir.join(PORT_ALLOCATIONS_FILE)
    }

    fn load_table(&self) -> Result<PortAllocationTable, AllocatorError> {
        let path = self.allocations_path();
        if !path.exists() {
            return Ok(PortAllocationTable::default());
        }
        let content = fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| AllocatorError::Io(std::io::Error::other(e.to_string())))
    }

    fn save_table(&self, table: &PortAllocationTable) -> Result<(), AllocatorError> {
        fs::create_dir_all(&self.agents_dir)?;
        let path = self.allocations_path();
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(table)
            .map_err(|e| AllocatorError::Io(std::io::Error::other(e.to_string())))?;
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&data)?;
            f.sync_all().ok();
        }
        fs::rename(&tmp, &path)?;
        if let Some(parent) = path.parent()
            && let Ok(dir) = fs::File::open(parent)
        {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// Allocate a fresh port pair and worktree path for `run_id`. Idempotent:
    /// calling again for a run that already holds an allocation returns the
    /// existing one rather than erroring.
    pub fn allocate(&self, run_id: &str) -> Result<(PortAllocation, PathBuf), AllocatorError> {
        let _guard = self
            .critical_section
            .lock()
            .expect("port allocator mutex poisoned");
        let _file_lock = PortAllocationLock::acquire(&self.agents_dir)?;

        let mut table = self.load_table()?;

        if let Some(existing) = table.allocations.get(run_id) {
            let worktree = self.worktree_path(run_id);
            return Ok((existing.clone(), worktree));
        }

        let used_backend: std::collections::HashSet<u16> =
            table.allocations.values().map(|a| a.backend_port).collect();
        let used_frontend: std::collections::HashSet<u16> = table
            .allocations
            .values()
            .map(|a| a.frontend_port)
            .collect();

        let backend_port = self
            .backend_range
            .clone()
            .find(|p| !used_backend.contains(p))
            .ok_or(AllocatorError::PortsExhausted)?;
        let frontend_port = self
            .frontend_range
            .clone()
            .find(|p| !used_frontend.contains(p))
            .ok_or(AllocatorError::PortsExhausted)?;

        let allocation = PortAllocation {
            run_id: run_id.to_string(),
            backend_port,
            frontend_port,
            allocated_at: Utc::now(),
        };

        table
            .allocations
            .insert(run_id.to_string(), allocation.clone());
        self.save_table(&table)?;

        let worktree = self.worktree_path(run_id);
        Ok((allocation, worktree))
    }

    /// Release the port pair held by `run_id`. Called by the Cleanup phase.
    pub fn release(&self, run_id: &str) -> Result<(), AllocatorError> {
        let _guard = self
            .critical_section
            .lock()
            .expect("port allocator mutex poisoned");
        let _file_lock = PortAllocationLock::acquire(&self.agents_dir)?;

        let mut table = self.load_table()?;
        table.allocations.remove(run_id);
        self.save_table(&table)
    }

    pub fn worktree_path(&self, run_id: &str) -> PathBuf {
        self.worktree_base.join(run_id)
    }

    pub fn current_allocation(&self, run_id: &str) -> Result<Option<PortAllocation>, AllocatorError> {
        Ok(self.load_table()?.allocations.get(run_id).cloned())
    }

    pub fn all_allocations(&self) -> Result<Vec<PortAllocation>, AllocatorError> {
        Ok(self.load_table()?.allocations.into_values().collect())
    }
}

pub fn ensure_worktree_base(base: &Path) -> Result<(), AllocatorError> {
    fs::create_dir_all(base)?;
    Ok(())
}
