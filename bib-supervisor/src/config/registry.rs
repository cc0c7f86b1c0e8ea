//! Registry of loaded BIB configurations.
//!
//! Configurations are immutable once loaded; a reload replaces the whole
//! `Arc` snapshot atomically, so readers either see the old tree or the new
//! one, never a mix. Workflow runs hold their own `Arc` and are unaffected
//! by eviction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::bib::BibConfiguration;

/// Shared map of BIB id → configuration snapshot.
#[derive(Debug, Default)]
pub struct BibRegistry {
    bibs: RwLock<HashMap<String, Arc<BibConfiguration>>>,
}

impl BibRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a configuration, replacing any previous snapshot with the
    /// same id. Returns the replaced snapshot, if there was one.
    pub fn insert(&self, bib: BibConfiguration) -> Option<Arc<BibConfiguration>> {
        let id = bib.id.clone();
        let replaced = self
            .bibs
            .write()
            .unwrap()
            .insert(id.clone(), Arc::new(bib));
        if replaced.is_some() {
            tracing::info!(bib = %id, "configuration replaced");
        } else {
            tracing::info!(bib = %id, "configuration registered");
        }
        replaced
    }

    /// The current snapshot for a BIB id.
    pub fn get(&self, id: &str) -> Option<Arc<BibConfiguration>> {
        self.bibs.read().unwrap().get(id).cloned()
    }

    /// Whether a BIB id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.bibs.read().unwrap().contains_key(id)
    }

    /// All registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bibs.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Unlinks a BIB id. In-flight runs keep their own snapshot.
    pub fn evict(&self, id: &str) -> Option<Arc<BibConfiguration>> {
        let evicted = self.bibs.write().unwrap().remove(id);
        if evicted.is_some() {
            tracing::info!(bib = %id, "configuration evicted");
        }
        evicted
    }
}
