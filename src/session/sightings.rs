//! Devices seen during a scan.
//!
//! Presentational only: the list never influences matching.

use chrono::{DateTime, Utc};

use crate::ble::uuids::SIGHTING_CAP;

/// A device seen during the current scan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSighting {
    /// Device label (name, address or "unknown").
    pub id: String,
    /// When the device was first seen in this scan.
    pub first_seen_at: DateTime<Utc>,
}

/// Insertion-ordered, deduplicated, capped list of sightings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SightingList {
    entries: Vec<DeviceSighting>,
    cap: usize,
}

impl SightingList {
    /// Create an empty list holding at most `cap` entries.
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::with_capacity(cap),
            cap,
        }
    }

    /// Record a label. Returns `true` if the list changed.
    ///
    /// Blank labels, duplicates and anything past the cap are ignored.
    pub fn record(&mut self, label: &str, seen_at: DateTime<Utc>) -> bool {
        if label.trim().is_empty() || self.is_full() || self.contains(label) {
            return false;
        }
        self.entries.push(DeviceSighting {
            id: label.to_string(),
            first_seen_at: seen_at,
        });
        true
    }

    /// Check if a label is already recorded.
    pub fn contains(&self, label: &str) -> bool {
        self.entries.iter().any(|s| s.id == label)
    }

    /// Check if the cap has been reached.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.cap
    }

    /// Forget every sighting.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of sightings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over sightings in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceSighting> {
        self.entries.iter()
    }

    /// Copy of the sightings.
    pub fn to_vec(&self) -> Vec<DeviceSighting> {
        self.entries.clone()
    }

    /// Labels joined with ", ".
    pub fn joined(&self) -> String {
        self.entries
            .iter()
            .map(|s| s.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl Default for SightingList {
    fn default() -> Self {
        Self::new(SIGHTING_CAP)
    }
}
