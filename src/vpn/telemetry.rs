//! Bandwidth accounting that survives process and container restarts.
//!
//! A subsystem's live rx/tx counters reset to zero whenever it restarts.
//! Each observation is compared with the previous one persisted on disk:
//! a reading lower than the last one means a reset happened, and the last
//! reading (the final value of the previous session) is folded into the
//! running total. Observing the same reading twice changes nothing.

use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::HubResult;
use crate::fsutil;

/// Live counters read from a subsystem
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub rx: u64,
    pub tx: u64,
}

impl Counters {
    pub fn new(rx: u64, tx: u64) -> Self {
        Self { rx, tx }
    }
}

/// Outcome of reading a subsystem's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CounterSample {
    /// Not running
    #[default]
    Absent,
    /// Running, but the counters could not be read
    Unreadable,
    Live(Counters),
}

/// Persisted state for one subsystem
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub last_rx: u64,
    pub last_tx: u64,
    pub total_rx: u64,
    pub total_tx: u64,
}

/// What an observation reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BandwidthReport {
    pub session_rx: u64,
    pub session_tx: u64,
    pub total_rx: u64,
    pub total_tx: u64,
}

impl CounterSnapshot {
    /// Fold a new reading into the snapshot and return the updated snapshot.
    ///
    /// rx and tx are checked together: if either went backwards the
    /// subsystem restarted, and both previous readings are banked.
    pub fn advance(&self, current: Counters) -> CounterSnapshot {
        let reset = current.rx < self.last_rx || current.tx < self.last_tx;
        let (total_rx, total_tx) = if reset {
            (
                self.total_rx.saturating_add(self.last_rx),
                self.total_tx.saturating_add(self.last_tx),
            )
        } else {
            (self.total_rx, self.total_tx)
        };

        CounterSnapshot {
            last_rx: current.rx,
            last_tx: current.tx,
            total_rx,
            total_tx,
        }
    }

    pub fn report(&self) -> BandwidthReport {
        BandwidthReport {
            session_rx: self.last_rx,
            session_tx: self.last_tx,
            total_rx: self.total_rx.saturating_add(self.last_rx),
            total_tx: self.total_tx.saturating_add(self.last_tx),
        }
    }
}

/// Counter-pair snapshot file for one subsystem.
///
/// Stored as `KEY=value` lines with a per-subsystem key prefix
/// (`LAST_RX`, `WGE_TOTAL_TX`, ...). Missing or non-numeric values read as 0.
#[derive(Debug, Clone)]
pub struct BandwidthAccumulator {
    path: PathBuf,
    key_prefix: String,
}

impl BandwidthAccumulator {
    pub fn new(path: impl Into<PathBuf>, key_prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key_prefix: key_prefix.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Load the persisted snapshot; absent or unreadable state reads as zero
    pub fn load(&self) -> CounterSnapshot {
        let content = match fsutil::read_optional(&self.path) {
            Ok(Some(content)) => content,
            Ok(None) => return CounterSnapshot::default(),
            Err(e) => {
                warn!("Cannot read bandwidth snapshot {:?}: {}", self.path, e);
                return CounterSnapshot::default();
            }
        };

        let values = fsutil::parse_key_values(&content);
        let get = |name: &str| {
            values
                .get(&self.key(name))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        CounterSnapshot {
            last_rx: get("LAST_RX"),
            last_tx: get("LAST_TX"),
            total_rx: get("TOTAL_RX"),
            total_tx: get("TOTAL_TX"),
        }
    }

    /// Persist a snapshot with a whole-file replace
    pub fn store(&self, snapshot: &CounterSnapshot) -> HubResult<()> {
        let content = fsutil::render_key_values([
            (self.key("LAST_RX").as_str(), snapshot.last_rx.to_string()),
            (self.key("LAST_TX").as_str(), snapshot.last_tx.to_string()),
            (self.key("TOTAL_RX").as_str(), snapshot.total_rx.to_string()),
            (self.key("TOTAL_TX").as_str(), snapshot.total_tx.to_string()),
        ]);
        fsutil::atomic_write(&self.path, content.as_bytes(), None)
    }

    /// Record a reading and return session and total figures.
    ///
    /// `None` means the subsystem is down and reads as zero: the last
    /// session is banked and the zero reading is persisted, so a restart
    /// before the next poll cannot hide it.
    pub fn observe(&self, current: Option<Counters>) -> HubResult<BandwidthReport> {
        let previous = self.load();

        let current = current.unwrap_or_else(|| {
            debug!("Subsystem for {:?} unavailable, reading as zero", self.path);
            Counters::default()
        });

        let next = previous.advance(current);
        if next.total_rx != previous.total_rx || next.total_tx != previous.total_tx {
            info!(
                "Counter reset detected for {:?}: banked rx={} tx={}",
                self.path, previous.last_rx, previous.last_tx
            );
        }
        if next != previous {
            self.store(&next)?;
        }

        Ok(next.report())
    }

    /// Record a sample. An unreadable sample reports the persisted figures
    /// and leaves them untouched.
    pub fn record(&self, sample: CounterSample) -> HubResult<BandwidthReport> {
        match sample {
            CounterSample::Absent => self.observe(None),
            CounterSample::Live(counters) => self.observe(Some(counters)),
            CounterSample::Unreadable => Ok(self.load().report()),
        }
    }
}
