//! Source id to destination number reconciliation.
//!
//! Issues and pull requests share one numbering space at the destination, so
//! a source id that collides with an existing pull request is moved past
//! every number in use.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{PushError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationMap {
    entries: BTreeMap<u64, u64>,
    reserved: BTreeSet<u64>,
}

/// Builds the map for source ids `1..=max_source_id`.
///
/// Ids outside `reserved` keep their number. Colliding ids, in ascending
/// order, get consecutive numbers starting after the largest of
/// `max_source_id` and every reserved number.
pub fn build_map(max_source_id: u64, reserved: &BTreeSet<u64>) -> ReconciliationMap {
    let ceiling = reserved
        .last()
        .copied()
        .unwrap_or(0)
        .max(max_source_id);
    let mut next = ceiling + 1;
    let mut entries = BTreeMap::new();

    for id in 1..=max_source_id {
        if reserved.contains(&id) {
            log::info!("source {id} collides with a reserved number, moving it to #{next}");
            entries.insert(id, next);
            next += 1;
        } else {
            entries.insert(id, id);
        }
    }

    ReconciliationMap {
        entries,
        reserved: reserved.clone(),
    }
}

impl ReconciliationMap {
    pub fn get(&self, source_id: u64) -> Option<u64> {
        self.entries.get(&source_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reserved(&self) -> &BTreeSet<u64> {
        &self.reserved
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.entries.iter().map(|(k, v)| (*k, *v))
    }

    /// Ids whose destination number differs from the source id.
    pub fn relocated(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.iter().filter(|(k, v)| k != v)
    }

    /// Checks that the map is injective, leaves non-colliding ids in place
    /// and never targets a reserved number.
    pub fn verify(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (source, dest) in self.iter() {
            if !seen.insert(dest) {
                return Err(PushError::Structural(format!(
                    "destination #{dest} is assigned twice"
                )));
            }
            if self.reserved.contains(&dest) {
                return Err(PushError::Structural(format!(
                    "source {source} maps onto reserved #{dest}"
                )));
            }
            if !self.reserved.contains(&source) && source != dest {
                return Err(PushError::Structural(format!(
                    "source {source} does not collide but maps to #{dest}"
                )));
            }
        }
        Ok(())
    }
}
