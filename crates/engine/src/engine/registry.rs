//! Registry of deployed process definitions
//!
//! Definitions are immutable once deployed and shared as `Arc`s, so units of
//! work running on different workers read them without locking.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::ProcessDefinition;

#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: DashMap<Uuid, Arc<ProcessDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a definition, returning its id
    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Uuid, EngineError> {
        definition.validate()?;
        let id = definition.id;
        if self.definitions.contains_key(&id) {
            return Err(EngineError::Definition(format!(
                "process definition {id} is already deployed"
            )));
        }
        info!(
            process_definition_id = %id,
            name = %definition.name,
            version = %definition.version,
            flow_nodes = definition.flow_nodes.len(),
            "deployed process definition"
        );
        self.definitions.insert(id, Arc::new(definition));
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.definitions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::Definition(format!("unknown process definition {id}")))
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
