//! Concurrent task lifecycle and subscriber fan-out (spec §4.9): owns every
//! session and its live task exclusively, enforces one running task per
//! session (`SessionBusy` otherwise), and fans out agent events to
//! subscribers over per-subscriber bounded `mpsc` channels, so one slow
//! subscriber can be dropped without affecting the others — a single shared
//! broadcast channel could not do that.

use crate::action::ActionDispatcher;
use crate::agent::Agent;
use crate::apps::AppRegistry;
use crate::callbacks::{ConfirmationCallback, TakeoverCallback};
use crate::config::{AgentConfig, Language};
use crate::device::connection::ConnectionManager;
use crate::device::DeviceBackend;
use crate::errors::AgentError;
use crate::model::ModelBackend;
use crate::store::{BlobStore, Page, TaskFilter, TaskStore};
use crate::tracker::StepTracker;
use crate::types::{AgentEvent, TaskRecord, TaskStatus};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

const SUBSCRIBER_BACKLOG: usize = 256;

/// Per-task overrides accepted by `start` (spec §4.9's `configOverrides`).
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_steps: Option<u32>,
    pub device_id: Option<String>,
    pub language: Option<Language>,
}

/// The shared, non-owning collaborators every task's `Agent` is built from.
/// Constructed once at startup and handed to `SessionManager`.
#[derive(Clone)]
pub struct Collaborators {
    pub task_store: Arc<dyn TaskStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub model: Arc<dyn ModelBackend>,
    pub apps: Arc<AppRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub device: Arc<dyn DeviceBackend>,
    pub confirmation: Arc<dyn ConfirmationCallback>,
    pub takeover: Arc<dyn TakeoverCallback>,
    pub spill_dir: PathBuf,
    pub default_agent_config: AgentConfig,
}

struct SessionState {
    id: String,
    running: AtomicBool,
    cancel: SyncMutex<Option<CancellationToken>>,
    subscribers: SyncMutex<Vec<mpsc::Sender<AgentEvent>>>,
}

/// Owns the set of sessions and live tasks exclusively (spec §4's ownership
/// summary).
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<DashMap<String, Arc<SessionState>>>,
    collaborators: Collaborators,
}

impl SessionManager {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { sessions: Arc::new(DashMap::new()), collaborators }
    }

    pub fn create_session(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            Arc::new(SessionState {
                id: session_id.clone(),
                running: AtomicBool::new(false),
                cancel: SyncMutex::new(None),
                subscribers: SyncMutex::new(Vec::new()),
            }),
        );
        session_id
    }

    /// Allocates a task, launches its `Agent` on a dedicated worker, and
    /// returns immediately. Fails with `SessionBusy` if the session already
    /// has a running task.
    pub async fn start(
        &self,
        session_id: &str,
        task_description: String,
        overrides: ConfigOverrides,
    ) -> Result<String, AgentError> {
        let state = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionState {
                    id: session_id.to_string(),
                    running: AtomicBool::new(false),
                    cancel: SyncMutex::new(None),
                    subscribers: SyncMutex::new(Vec::new()),
                })
            })
            .clone();

        if state.running.swap(true, Ordering::SeqCst) {
            return Err(AgentError::SessionBusy);
        }

        let task_id = Uuid::new_v4().to_string();
        let mut agent_config = self.collaborators.default_agent_config.clone();
        if let Some(max_steps) = overrides.max_steps {
            agent_config.max_steps = max_steps;
        }
        if overrides.device_id.is_some() {
            agent_config.device_id = overrides.device_id;
        }
        if let Some(language) = overrides.language {
            agent_config.language = language;
        }

        let now = chrono::Utc::now();
        let task_record = TaskRecord {
            task_id: task_id.clone(),
            session_id: session_id.to_string(),
            description: task_description.clone(),
            status: TaskStatus::Running,
            created_at: now,
            last_activity: now,
            end_time: None,
            result: None,
            error: None,
        };
        self.collaborators.task_store.create_task(&task_record).await?;

        let cancel = CancellationToken::new();
        *state.cancel.lock().expect("session cancel mutex poisoned") = Some(cancel.clone());

        let event_state = state.clone();
        let event_session_id = session_id.to_string();
        let event_sink: crate::tracker::EventSink = Arc::new(move |event: AgentEvent| {
            let mut subscribers = event_state.subscribers.lock().expect("subscribers mutex poisoned");
            subscribers.retain(|tx| {
                if tx.try_send(event.clone()).is_ok() {
                    true
                } else {
                    // Best-effort: the channel may be full or already
                    // closed, in which case this send is a no-op, but a
                    // subscriber with room left gets a clean disconnect
                    // marker instead of silently going quiet.
                    let _ = tx.try_send(AgentEvent::Disconnected { session_id: event_session_id.clone() });
                    false
                }
            });
        });

        let tracker = Arc::new(StepTracker::new(
            task_id.clone(),
            self.collaborators.task_store.clone(),
            self.collaborators.blob_store.clone(),
            &self.collaborators.spill_dir,
            event_sink.clone(),
        ));

        let agent = Agent {
            task_id: task_id.clone(),
            config: agent_config,
            connections: self.collaborators.connections.clone(),
            device: self.collaborators.device.clone(),
            apps: self.collaborators.apps.clone(),
            model: self.collaborators.model.clone(),
            dispatcher: Arc::new(ActionDispatcher::new(
                self.collaborators.device.clone(),
                self.collaborators.apps.clone(),
                self.collaborators.confirmation.clone(),
            )),
            takeover: self.collaborators.takeover.clone(),
            tracker,
            event_sink,
        };

        let task_store = self.collaborators.task_store.clone();
        let finishing_task_id = task_id.clone();
        let finishing_state = state.clone();
        tokio::spawn(async move {
            let outcome = agent.run(&task_description, &cancel).await;
            finishing_state.running.store(false, Ordering::SeqCst);
            *finishing_state.cancel.lock().expect("session cancel mutex poisoned") = None;

            let (result, error) = match outcome.status {
                TaskStatus::Completed => (outcome.message, None),
                TaskStatus::Error => (None, outcome.message),
                TaskStatus::Stopped => (None, None),
                TaskStatus::Running => (None, None), // unreachable: run() never returns this
            };
            if let Err(e) = task_store
                .update_task_status(&finishing_task_id, outcome.status, Some(chrono::Utc::now()), result, error)
                .await
            {
                warn!(task_id = %finishing_task_id, error = %e, "failed to persist terminal task status");
            }
        });

        info!(session_id, task_id, "task started");
        Ok(task_id)
    }

    /// Signals the session's running task to cancel. Idempotent: a no-op if
    /// nothing is running.
    pub fn stop(&self, session_id: &str) {
        if let Some(state) = self.sessions.get(session_id) {
            if let Some(cancel) = state.cancel.lock().expect("session cancel mutex poisoned").as_ref() {
                cancel.cancel();
            }
        }
    }

    /// Registers a subscriber for every event emitted by tasks in this
    /// session. The returned receiver is disconnected (closed) once its
    /// backlog exceeds `SUBSCRIBER_BACKLOG` undelivered events.
    pub fn subscribe(&self, session_id: &str) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BACKLOG);
        let state = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionState {
                    id: session_id.to_string(),
                    running: AtomicBool::new(false),
                    cancel: SyncMutex::new(None),
                    subscribers: SyncMutex::new(Vec::new()),
                })
            })
            .clone();
        state.subscribers.lock().expect("subscribers mutex poisoned").push(tx);
        rx
    }

    pub async fn query(&self, task_id: &str) -> Result<Option<TaskRecord>, AgentError> {
        self.collaborators.task_store.get_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: TaskFilter, page: Page) -> Result<Vec<TaskRecord>, AgentError> {
        self.collaborators.task_store.list_tasks(filter, page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{AutoApprove, AutoCancelTakeover};
    use crate::config::AppRegistryConfig;
    use crate::device::DeviceIO;
    use crate::model::{Message, ModelReply};
    use crate::store::InMemoryTaskStore;

    struct NullBlobStore;
    #[async_trait::async_trait]
    impl BlobStore for NullBlobStore {
        async fn put(&self, _key: &str, _bytes: Vec<u8>, _ct: &str) -> Result<String, AgentError> {
            Ok("file:///dev/null".into())
        }
        async fn delete(&self, _key: &str) -> Result<(), AgentError> {
            Ok(())
        }
    }

    struct NeverRepliesModel;
    #[async_trait::async_trait]
    impl ModelBackend for NeverRepliesModel {
        async fn request(&self, _messages: &[Message], _cancel: &CancellationToken) -> Result<ModelReply, AgentError> {
            Err(AgentError::ModelPermanent("no replies configured".into()))
        }
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("droidstep-session-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager() -> SessionManager {
        SessionManager::new(Collaborators {
            task_store: Arc::new(InMemoryTaskStore::new()),
            blob_store: Arc::new(NullBlobStore),
            model: Arc::new(NeverRepliesModel),
            apps: Arc::new(AppRegistry::new(&AppRegistryConfig::default())),
            connections: Arc::new(ConnectionManager::new()),
            device: Arc::new(DeviceIO::new()),
            confirmation: Arc::new(AutoApprove),
            takeover: Arc::new(AutoCancelTakeover),
            spill_dir: tempdir(),
            default_agent_config: AgentConfig { max_steps: 3, device_id: None, language: Language::En, verbose: false, recording_enabled: false },
        })
    }

    #[tokio::test]
    async fn second_start_in_same_session_fails_with_session_busy() {
        let manager = manager();
        let session_id = manager.create_session();
        let first = manager.start(&session_id, "task one".into(), ConfigOverrides::default()).await;
        assert!(first.is_ok());
        let second = manager.start(&session_id, "task two".into(), ConfigOverrides::default()).await;
        assert!(matches!(second, Err(AgentError::SessionBusy)));
    }

    #[tokio::test]
    async fn stop_on_idle_session_is_a_harmless_no_op() {
        let manager = manager();
        let session_id = manager.create_session();
        manager.stop(&session_id); // no running task; must not panic
    }

    #[tokio::test]
    async fn distinct_sessions_can_start_concurrently() {
        let manager = manager();
        let a = manager.create_session();
        let b = manager.create_session();
        assert!(manager.start(&a, "task a".into(), ConfigOverrides::default()).await.is_ok());
        assert!(manager.start(&b, "task b".into(), ConfigOverrides::default()).await.is_ok());
    }
}
