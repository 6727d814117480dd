//! Shared model cache, one entry per [`Identifier`].

use dashmap::DashMap;
use std::sync::Arc;

use super::{Identifier, Model, ModelId};
use crate::observability::metrics;

#[derive(Default)]
pub struct ModelCache {
    models: DashMap<Identifier, Arc<Model>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &Identifier) -> Option<Arc<Model>> {
        self.models.get(identifier).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert `model` unless another model already owns `identifier`.
    ///
    /// Returns the cached model and whether it is the one passed in.
    pub fn get_or_insert(&self, identifier: Identifier, model: Arc<Model>) -> (Arc<Model>, bool) {
        let mut inserted = false;
        let cached = Arc::clone(
            self.models
                .entry(identifier)
                .or_insert_with(|| {
                    inserted = true;
                    model
                })
                .value(),
        );
        if inserted {
            metrics::set_cached_models(self.models.len());
        }
        (cached, inserted)
    }

    /// Remove the entry for `identifier` only if it still belongs to model `id`.
    pub fn remove_if_owner(&self, identifier: &Identifier, id: ModelId) -> bool {
        let removed = self
            .models
            .remove_if(identifier, |_, model| model.id() == id)
            .is_some();
        if removed {
            metrics::set_cached_models(self.models.len());
        }
        removed
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.models.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Sorted snapshot of cached identifiers.
    pub fn identifiers(&self) -> Vec<Identifier> {
        let mut keys: Vec<Identifier> = self.models.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}
