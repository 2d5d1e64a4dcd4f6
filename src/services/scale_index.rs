//! Parameter-to-identifier index for one image field
//!
//! Entries keep insertion order so enumeration is reproducible. A hash map
//! over the normalized parameters answers lookups without scanning. The
//! identifier sequence and the digest of the original the scales were
//! derived from travel with the index when it is persisted.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::errors::DuplicateParametersError;
use crate::models::{IdSequence, ScaleParameters};

/// One `{parameters, id}` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub parameters: ScaleParameters,
    pub id: String,
}

/// Serialized form of [`ScaleIndex`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexState {
    #[serde(default)]
    pub entries: Vec<IndexEntry>,
    #[serde(default)]
    pub sequence: IdSequence,
    #[serde(default)]
    pub source_digest: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScaleIndex {
    entries: Vec<IndexEntry>,
    by_parameters: HashMap<ScaleParameters, String>,
    sequence: IdSequence,
    source_digest: Option<String>,
}

impl ScaleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state, dropping entries that break uniqueness
    pub fn from_state(state: IndexState) -> Self {
        let mut index = Self {
            sequence: state.sequence,
            source_digest: state.source_digest,
            ..Self::default()
        };

        let mut seen_ids = HashSet::new();
        for entry in state.entries {
            if !seen_ids.insert(entry.id.clone()) {
                warn!("Dropping index entry with duplicate id {}", entry.id);
                continue;
            }
            if let Err(e) = index.insert(entry.parameters, entry.id) {
                warn!("Dropping index entry: {}", e);
            }
        }

        index
    }

    pub fn to_state(&self) -> IndexState {
        IndexState {
            entries: self.entries.clone(),
            sequence: self.sequence.clone(),
            source_digest: self.source_digest.clone(),
        }
    }

    /// Exact-match lookup on normalized parameters
    pub fn lookup(&self, parameters: &ScaleParameters) -> Option<&str> {
        self.by_parameters.get(parameters).map(String::as_str)
    }

    /// Append an entry; the parameters must not be indexed yet
    pub fn insert(
        &mut self,
        parameters: ScaleParameters,
        id: String,
    ) -> Result<(), DuplicateParametersError> {
        if self.by_parameters.contains_key(&parameters) {
            return Err(DuplicateParametersError {
                fingerprint: parameters.fingerprint(),
            });
        }
        debug_assert!(!self.contains(&id), "identifier {id} already indexed");

        self.by_parameters.insert(parameters.clone(), id.clone());
        self.entries.push(IndexEntry { parameters, id });
        Ok(())
    }

    /// Remove every entry referencing `id`; returns whether any existed
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.by_parameters.retain(|_, indexed| indexed != id);
        self.entries.len() != before
    }

    /// Identifiers in insertion order
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.id.clone()).collect()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocate an identifier not present in the index and never issued before
    pub fn generate_id(&mut self) -> String {
        let entries = &self.entries;
        self.sequence
            .generate(|candidate| entries.iter().any(|entry| entry.id == candidate))
    }

    /// Drop all entries, returning their identifiers; the sequence is kept
    pub fn clear(&mut self) -> Vec<String> {
        self.by_parameters.clear();
        self.entries.drain(..).map(|entry| entry.id).collect()
    }

    pub fn source_digest(&self) -> Option<&str> {
        self.source_digest.as_deref()
    }

    pub fn set_source_digest(&mut self, digest: String) {
        self.source_digest = Some(digest);
    }
}
