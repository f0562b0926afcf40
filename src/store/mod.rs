//! TaskStore and BlobStore collaborator interfaces (spec §6, component
//! #10), plus in-memory/filesystem default implementations so the core is
//! runnable standalone without a real external store. Grounded on the
//! teacher's `Workspace` file read/write/append helpers (`soul/mod.rs`) for
//! the filesystem `BlobStore`, and on the `other_examples` Minerva
//! `#[async_trait]` trait convention for the interface shape.

use crate::errors::AgentError;
use crate::types::{StepRecord, TaskRecord, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub session_id: Option<String>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { offset: 0, limit: 50 }
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &TaskRecord) -> Result<(), AgentError>;

    /// Atomic; auto-stamps `last_activity`.
    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        end_time: Option<DateTime<Utc>>,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), AgentError>;

    /// Must tolerate replay for the same `(taskId, step_number)` (idempotent
    /// upsert, spec P8).
    async fn append_steps(&self, task_id: &str, steps: &[StepRecord]) -> Result<(), AgentError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, AgentError>;
    async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<TaskRecord>, AgentError>;
    async fn get_steps(&self, task_id: &str, page: Page) -> Result<Vec<StepRecord>, AgentError>;
    async fn get_screenshots(&self, task_id: &str) -> Result<Vec<String>, AgentError>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, AgentError>;
    async fn delete(&self, key: &str) -> Result<(), AgentError>;
}

/// Default in-process `TaskStore`. Steps are kept in a `BTreeMap` keyed by
/// step number so replaying `appendSteps` for an already-seen step number
/// overwrites rather than duplicates.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<DashMap<String, TaskRecord>>,
    steps: Arc<DashMap<String, BTreeMap<u32, StepRecord>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_task(&self, task: &TaskRecord) -> Result<(), AgentError> {
        self.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        end_time: Option<DateTime<Utc>>,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<(), AgentError> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| AgentError::StoreError(format!("unknown task {task_id}")))?;
        entry.status = status;
        entry.last_activity = Utc::now();
        if let Some(end_time) = end_time {
            entry.end_time = Some(end_time);
        }
        if result.is_some() {
            entry.result = result;
        }
        if error.is_some() {
            entry.error = error;
        }
        Ok(())
    }

    async fn append_steps(&self, task_id: &str, steps: &[StepRecord]) -> Result<(), AgentError> {
        let mut entry = self.steps.entry(task_id.to_string()).or_default();
        for step in steps {
            entry.insert(step.step_number, step.clone());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, AgentError> {
        Ok(self.tasks.get(task_id).map(|t| t.clone()))
    }

    async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<TaskRecord>, AgentError> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .iter()
            .map(|t| t.clone())
            .filter(|t| filter.session_id.as_deref().map_or(true, |s| s == t.session_id))
            .filter(|t| filter.status.map_or(true, |s| s == t.status))
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks.into_iter().skip(page.offset).take(page.limit).collect())
    }

    async fn get_steps(&self, task_id: &str, page: Page) -> Result<Vec<StepRecord>, AgentError> {
        Ok(self
            .steps
            .get(task_id)
            .map(|m| m.values().cloned().skip(page.offset).take(page.limit).collect())
            .unwrap_or_default())
    }

    async fn get_screenshots(&self, task_id: &str) -> Result<Vec<String>, AgentError> {
        Ok(self
            .steps
            .get(task_id)
            .map(|m| m.values().filter_map(|s| s.screenshot_ref.clone()).collect())
            .unwrap_or_default())
    }
}

/// Default filesystem `BlobStore`: writes under `root/<key>` and returns a
/// `file://` URL.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<String, AgentError> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::StoreError(format!("creating {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AgentError::StoreError(format!("writing {}: {e}", path.display())))?;
        Ok(format!("file://{}", path.display()))
    }

    async fn delete(&self, key: &str) -> Result<(), AgentError> {
        let path = self.root.join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::StoreError(format!("deleting {}: {e}", path.display()))),
        }
    }
}
