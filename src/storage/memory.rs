//! In-process stores.
//!
//! Records live only as long as the process. The task pool can be seeded
//! from a JSON array of tasks.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EvaluationStore, StoreError, TaskPool};
use crate::evaluation::{Evaluation, EvaluationVerdict, TaskLike};

/// Evaluation records held in memory.
#[derive(Debug, Default)]
pub struct MemoryEvaluationStore {
    records: RwLock<HashMap<Uuid, Evaluation>>,
}

impl MemoryEvaluationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl EvaluationStore for MemoryEvaluationStore {
    async fn insert(&self, evaluation: &Evaluation) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&evaluation.id) {
            return Err(StoreError::Duplicate(evaluation.id));
        }
        records.insert(evaluation.id, evaluation.clone());
        Ok(())
    }

    async fn finalize(&self, id: Uuid, verdict: &EvaluationVerdict) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        Ok(match records.get_mut(&id) {
            Some(record) => record.finish(verdict.clone()),
            None => false,
        })
    }

    async fn get(&self, id: Uuid) -> Result<Option<Evaluation>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }
}

/// Fixed list of tasks.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskPool {
    tasks: Vec<TaskLike>,
}

impl MemoryTaskPool {
    pub fn new(tasks: Vec<TaskLike>) -> Self {
        Self { tasks }
    }

    /// Loads a JSON array of `{id, title?, content}` objects.
    pub async fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let task_file_error = |reason: String| StoreError::TaskFile {
            path: path.display().to_string(),
            reason,
        };

        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| task_file_error(e.to_string()))?;
        let tasks: Vec<TaskLike> =
            serde_json::from_str(&raw).map_err(|e| task_file_error(e.to_string()))?;
        Ok(Self::new(tasks))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl TaskPool for MemoryTaskPool {
    async fn get_all_thoughts(&self) -> Result<Vec<TaskLike>, StoreError> {
        Ok(self.tasks.clone())
    }
}
