//! Entity-type registry.
//!
//! Maps an entity type name to a factory producing fresh, unwired
//! [`Model`]s. Registration happens once at startup and is append-only.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::db::Database;
use crate::error::{ErrorCode, Result, SyncError};
use crate::model::{Hooks, Model};

/// Builds a fresh model for one entity type.
pub trait ModelFactory: Send + Sync {
    fn create(&self) -> Model;
}

impl<F> ModelFactory for F
where
    F: Fn() -> Model + Send + Sync,
{
    fn create(&self) -> Model {
        self()
    }
}

#[derive(Default)]
pub struct Dispatcher {
    factories: HashMap<String, Arc<dyn ModelFactory>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`. Names cannot be registered twice.
    pub fn register(&mut self, name: impl Into<String>, factory: impl ModelFactory + 'static) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(SyncError::with_internal(
                ErrorCode::DuplicateEntityType,
                "Entity type is already registered",
                format!("duplicate entity type: {}", name),
            ));
        }
        info!(entity_type = %name, "Entity type registered");
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Register an entity type whose models use `database` and `hooks`.
    pub fn register_entity(
        &mut self,
        name: impl Into<String>,
        database: Arc<dyn Database>,
        hooks: Hooks,
    ) -> Result<()> {
        let name = name.into();
        let entity_type = name.clone();
        self.register(name, move || {
            Model::new(entity_type.clone(), Arc::clone(&database), hooks.clone())
        })
    }

    /// A fresh model for `name`.
    pub fn get(&self, name: &str) -> Result<Model> {
        self.factories
            .get(name)
            .map(|factory| factory.create())
            .ok_or_else(|| SyncError::unknown_entity_type(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn entity_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::model::ModelState;

    fn database() -> Arc<dyn Database> {
        Arc::new(MemoryDatabase::with_entities(["task"]))
    }

    #[test]
    fn test_get_returns_fresh_models() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_entity("task", database(), Hooks::default()).unwrap();

        let a = dispatcher.get("task").unwrap();
        let b = dispatcher.get("task").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.entity_type(), "task");
        assert_eq!(a.state(), ModelState::Unbound);
        assert_eq!(a.subscriber_count(), 0);
    }

    #[test]
    fn test_unknown_entity_type() {
        let dispatcher = Dispatcher::new();
        let err = dispatcher.get("ghost").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownEntityType);
        assert_eq!(err.client_code(), "model.not-found");
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register_entity("task", database(), Hooks::default()).unwrap();
        let err = dispatcher
            .register_entity("task", database(), Hooks::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateEntityType);
        assert_eq!(dispatcher.entity_types(), vec!["task".to_string()]);
    }

    #[test]
    fn test_closure_factory() {
        let db = database();
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register("note", move || Model::new("note", Arc::clone(&db), Hooks::default()))
            .unwrap();
        assert!(dispatcher.contains("note"));
        assert_eq!(dispatcher.len(), 1);
    }
}
