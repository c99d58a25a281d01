//! Deployment slot (A/B) tracking.
//!
//! Two parallel deployment identities let a rebuild come up next to the
//! running stack before the old one is removed. The current slot lives in a
//! one-character file and determines the prefix of every container name.
//! Callers read it fresh for every operation; an operator may swap slots
//! between two calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::HubResult;
use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    /// Parse a slot value, ignoring case and surrounding whitespace
    pub fn parse(raw: &str) -> Option<Slot> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" => Some(Slot::A),
            "B" => Some(Slot::B),
            _ => None,
        }
    }

    pub fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Slot::A => 'A',
            Slot::B => 'B',
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Reads and writes the slot file
#[derive(Debug, Clone)]
pub struct SlotManager {
    path: PathBuf,
    app_name: String,
}

impl SlotManager {
    pub fn new(path: impl Into<PathBuf>, app_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            app_name: app_name.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current slot.
    ///
    /// A missing file is initialized to `A`. Any content other than a single
    /// `A` or `B` (after trimming, any case) is reset to `A`.
    pub fn current_slot(&self) -> HubResult<Slot> {
        match fsutil::read_optional(&self.path)? {
            None => {
                info!("Initializing slot file {:?} to A", self.path);
                self.write(Slot::A)?;
                Ok(Slot::A)
            }
            Some(raw) => match Slot::parse(&raw) {
                Some(slot) => {
                    // Normalize "a\n" and friends to the canonical form
                    if raw != slot.as_char().to_string() {
                        self.write(slot)?;
                    }
                    Ok(slot)
                }
                None => {
                    warn!("Slot file {:?} holds invalid value {:?}, resetting to A", self.path, raw.trim());
                    self.write(Slot::A)?;
                    Ok(Slot::A)
                }
            },
        }
    }

    /// Container-name prefix for the current slot, e.g. `hub-a-`
    pub fn prefix(&self) -> HubResult<String> {
        let slot = self.current_slot()?;
        Ok(prefix_for(&self.app_name, slot))
    }

    /// Full container name of a service in the current slot
    pub fn container_name(&self, service: &str) -> HubResult<String> {
        Ok(format!("{}{}", self.prefix()?, service))
    }

    /// Switch to the other slot and return it
    pub fn swap(&self) -> HubResult<Slot> {
        let next = self.current_slot()?.other();
        self.write(next)?;
        info!("Swapped deployment slot to {}", next);
        Ok(next)
    }

    /// Set the slot explicitly
    pub fn set(&self, slot: Slot) -> HubResult<()> {
        self.write(slot)
    }

    fn write(&self, slot: Slot) -> HubResult<()> {
        fsutil::atomic_write(&self.path, slot.as_char().to_string().as_bytes(), None)
    }
}

/// Container-name prefix for an app and slot
pub fn prefix_for(app_name: &str, slot: Slot) -> String {
    format!("{}-{}-", app_name, slot.as_char().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SlotManager {
        SlotManager::new(dir.path().join(".active_slot"), "hub")
    }

    #[test]
    fn test_first_run_initializes_a() {
        let dir = TempDir::new().unwrap();
        let slots = manager(&dir);

        assert_eq!(slots.current_slot().unwrap(), Slot::A);
        assert_eq!(std::fs::read_to_string(slots.path()).unwrap(), "A");
    }

    #[test]
    fn test_corrupted_value_auto_heals() {
        let dir = TempDir::new().unwrap();
        let slots = manager(&dir);
        std::fs::write(slots.path(), "x").unwrap();

        assert_eq!(slots.current_slot().unwrap(), Slot::A);
        assert_eq!(std::fs::read_to_string(slots.path()).unwrap(), "A");
    }

    #[test]
    fn test_normalizes_case_and_whitespace() {
        let dir = TempDir::new().unwrap();
        let slots = manager(&dir);
        std::fs::write(slots.path(), "  b\n").unwrap();

        assert_eq!(slots.current_slot().unwrap(), Slot::B);
        assert_eq!(std::fs::read_to_string(slots.path()).unwrap(), "B");
    }

    #[test]
    fn test_prefix_is_read_fresh() {
        let dir = TempDir::new().unwrap();
        let slots = manager(&dir);

        assert_eq!(slots.prefix().unwrap(), "hub-a-");
        // External swap between two calls
        std::fs::write(slots.path(), "B").unwrap();
        assert_eq!(slots.prefix().unwrap(), "hub-b-");
        assert_eq!(slots.container_name("gluetun").unwrap(), "hub-b-gluetun");
    }

    #[test]
    fn test_swap() {
        let dir = TempDir::new().unwrap();
        let slots = manager(&dir);

        assert_eq!(slots.swap().unwrap(), Slot::B);
        assert_eq!(slots.swap().unwrap(), Slot::A);
        slots.set(Slot::B).unwrap();
        assert_eq!(slots.current_slot().unwrap(), Slot::B);
    }

    #[test]
    fn test_slot_parse() {
        assert_eq!(Slot::parse("a"), Some(Slot::A));
        assert_eq!(Slot::parse(" B "), Some(Slot::B));
        assert_eq!(Slot::parse("AB"), None);
        assert_eq!(Slot::parse(""), None);
    }
}
