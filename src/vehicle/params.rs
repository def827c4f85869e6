//! Vehicle parameter table and bulk-fetch bookkeeping.
//!
//! The autopilot streams its whole table after PARAM_REQUEST_LIST; the driver
//! watches for gaps and re-requests individual indices until everything is
//! present or the 10 s deadline forces readiness.

use anyhow::{anyhow, bail, Result};
use mavlink::common::MavParamType;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::time::{Duration, Instant};

pub const FETCH_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamEntry {
    pub index: u16,
    pub value: f32,
    pub encoding: MavParamType,
}

#[derive(Debug, PartialEq)]
pub enum ObserveOutcome {
    Stored,
    /// The declared total changed under us: the vehicle rebooted and the
    /// whole table needs a resync.
    TotalChanged,
}

#[derive(Debug, Default)]
struct TableInner {
    entries: HashMap<String, ParamEntry>,
    observed: HashSet<u16>,
    total: Option<u16>,
    forced: bool,
    missing: Vec<u16>,
    deadline: Option<Instant>,
}

pub struct ParamTable {
    inner: RwLock<TableInner>,
}

impl ParamTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TableInner::default()),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, TableInner>> {
        self.inner.write().map_err(|e| anyhow!("lock error: {}", e))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, TableInner>> {
        self.inner.read().map_err(|e| anyhow!("lock error: {}", e))
    }

    /// Records one PARAM_VALUE. The total is latched from the first message;
    /// a later message declaring a different total reports `TotalChanged`.
    pub fn observe(
        &self,
        name: &str,
        index: u16,
        value: f32,
        encoding: MavParamType,
        total: u16,
    ) -> Result<ObserveOutcome> {
        let mut g = self.write()?;
        match g.total {
            None => g.total = Some(total),
            Some(t) if t != total => return Ok(ObserveOutcome::TotalChanged),
            Some(_) => {}
        }
        g.observed.insert(index);
        g.entries.insert(
            name.trim_end_matches('\0').to_string(),
            ParamEntry {
                index,
                value,
                encoding,
            },
        );
        Ok(ObserveOutcome::Stored)
    }

    /// True once the first PARAM_VALUE of a burst has arrived.
    pub fn initialized(&self) -> bool {
        self.read().map(|g| g.total.is_some()).unwrap_or(false)
    }

    pub fn ready(&self) -> bool {
        self.read()
            .map(|g| {
                g.forced
                    || match g.total {
                        Some(total) => g.observed.len() >= total as usize,
                        None => false,
                    }
            })
            .unwrap_or(false)
    }

    pub fn set_deadline(&self, at: Instant) {
        if let Ok(mut g) = self.write() {
            g.deadline = Some(at);
        }
    }

    pub fn deadline_passed(&self) -> bool {
        self.read()
            .map(|g| g.deadline.map(|d| Instant::now() >= d).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Indices declared by the vehicle but not yet observed.
    pub fn missing_now(&self) -> Vec<u16> {
        self.read()
            .map(|g| match g.total {
                Some(total) => (0..total).filter(|i| !g.observed.contains(i)).collect(),
                None => Vec::new(),
            })
            .unwrap_or_default()
    }

    /// Gives up on the bulk fetch: retains the missing list for operators and
    /// marks the table ready.
    pub fn force_ready(&self, missing: Vec<u16>) {
        if let Ok(mut g) = self.write() {
            g.missing = missing;
            g.forced = true;
        }
    }

    /// The post-deadline missing list (empty if the fetch completed).
    pub fn missing(&self) -> Vec<u16> {
        self.read().map(|g| g.missing.clone()).unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Result<ParamEntry> {
        let g = self.read()?;
        match g.entries.get(name) {
            Some(entry) => Ok(*entry),
            None => bail!("param {} not found", name),
        }
    }

    pub fn get_by_index(&self, index: u16) -> Result<ParamEntry> {
        let g = self.read()?;
        g.entries
            .values()
            .find(|e| e.index == index)
            .copied()
            .ok_or_else(|| anyhow!("param index {} not found", index))
    }

    /// (observed, total, name -> value) for the bulk REST endpoint.
    /// NaNs are zeroed since JSON cannot carry them.
    pub fn all(&self) -> (usize, u16, HashMap<String, f32>) {
        match self.read() {
            Ok(g) => {
                let map = g
                    .entries
                    .iter()
                    .map(|(k, e)| (k.clone(), if e.value.is_nan() { 0.0 } else { e.value }))
                    .collect();
                (g.observed.len(), g.total.unwrap_or(0), map)
            }
            Err(_) => (0, 0, HashMap::new()),
        }
    }

    /// Clears everything; the driver re-enters the request-all phase on its
    /// next tick.
    pub fn reset(&self) {
        if let Ok(mut g) = self.write() {
            *g = TableInner::default();
        }
    }
}

impl Default for ParamTable {
    fn default() -> Self {
        Self::new()
    }
}
