//! Process-wide stage registry: the only authority on stage existence.
//! Constructed at boot and injected into the request surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;

use stagehand_engine::Engine;

use crate::executor::StepExecutor;
use crate::pipeline::PipelineState;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("stage id {0} already exists")]
    AlreadyExists(String),

    #[error("stage id {0} does not exist")]
    NotFound(String),
}

/// Everything the service holds for one live stage.
pub struct StageData {
    pub engine: Arc<dyn Engine>,
    pub state: Arc<PipelineState>,
    pub executor: Arc<StepExecutor>,
    pub created_at: DateTime<Utc>,
}

impl StageData {
    pub fn new(
        engine: Arc<dyn Engine>,
        state: Arc<PipelineState>,
        executor: Arc<StepExecutor>,
    ) -> Self {
        Self {
            engine,
            state,
            executor,
            created_at: Utc::now(),
        }
    }
}

/// Mapping from stage runtime id to stage data. Mutation is short and
/// non-blocking; the registry itself does no I/O.
#[derive(Default)]
pub struct StageRegistry {
    stages: Mutex<HashMap<String, Arc<StageData>>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: &str, data: Arc<StageData>) -> Result<(), RegistryError> {
        let mut stages = self.stages.lock().unwrap();
        if stages.contains_key(id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }
        stages.insert(id.to_string(), data);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<StageData>, RegistryError> {
        self.stages
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        self.stages
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Locates the stage currently holding a step, for the long-poll
    /// surface where callers address steps without naming the stage.
    pub fn find_step(&self, step_id: &str) -> Option<Arc<StageData>> {
        self.stages
            .lock()
            .unwrap()
            .values()
            .find(|stage| stage.executor.has_step(step_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::NullEngine;

    fn stage() -> Arc<StageData> {
        let engine: Arc<dyn Engine> = Arc::new(NullEngine::default());
        let state = Arc::new(PipelineState::new());
        let executor = Arc::new(StepExecutor::new(engine.clone(), state.clone()));
        Arc::new(StageData::new(engine, state, executor))
    }

    #[test]
    fn add_get_remove_round_trip() {
        let registry = StageRegistry::new();
        let data = stage();
        registry.add("S1", data.clone()).unwrap();

        let fetched = registry.get("S1").unwrap();
        assert!(Arc::ptr_eq(&fetched, &data));

        registry.remove("S1").unwrap();
        assert!(matches!(
            registry.get("S1"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_add_fails() {
        let registry = StageRegistry::new();
        registry.add("S1", stage()).unwrap();
        let err = registry.add("S1", stage()).unwrap_err();
        assert!(err.to_string().contains("already exist"));
    }

    #[test]
    fn remove_of_unknown_stage_fails() {
        let registry = StageRegistry::new();
        assert!(matches!(
            registry.remove("ghost"),
            Err(RegistryError::NotFound(_))
        ));
    }
}
