//! The per-task control loop (spec §4.8): perceive, prompt, call the model,
//! parse, execute, record, repeat until a terminal condition is reached.
//!
//! Structured as a bounded, cancellable, per-task step loop rather than a
//! free-running heartbeat: preflight device resolution, then up to
//! `max_steps` iterations of perceive → prompt → call model → parse →
//! execute → record, until a terminal condition is reached.

mod prompts;

use crate::action::{self, ActionDispatcher, Outcome};
use crate::apps::AppRegistry;
use crate::callbacks::TakeoverCallback;
use crate::config::{AgentConfig, Language};
use crate::device::{connection::ConnectionManager, DeviceBackend};
use crate::errors::AgentError;
use crate::model::{Content, Message, ModelBackend, Role};
use crate::tracker::{EventSink, StepTracker};
use crate::types::{ActionOutcome, AgentEvent, StepRecord, StepType, TaskStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MAX_CONSECUTIVE_PARSE_FAILURES: u32 = 2;
const FLUSH_GRACE: Duration = Duration::from_secs(10);

pub struct AgentOutcome {
    pub status: TaskStatus,
    pub message: Option<String>,
}

/// One task's worth of collaborators. Agent holds only non-owning
/// (`Arc`-shared) references, as spec §4's ownership summary requires — it
/// owns nothing exclusively except its own loop state.
pub struct Agent {
    pub task_id: String,
    pub config: AgentConfig,
    pub connections: Arc<ConnectionManager>,
    pub device: Arc<dyn DeviceBackend>,
    pub apps: Arc<AppRegistry>,
    pub model: Arc<dyn ModelBackend>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub takeover: Arc<dyn TakeoverCallback>,
    pub tracker: Arc<StepTracker>,
    pub event_sink: EventSink,
}

impl Agent {
    pub async fn run(&self, task_description: &str, cancel: &CancellationToken) -> AgentOutcome {
        let device_id = match self.resolve_device().await {
            Ok(id) => id,
            Err(e) => return self.terminal(TaskStatus::Error, format!("preflight failed: {e}")).await,
        };

        let mut context: Vec<Message> = vec![Message {
            role: Role::System,
            content: Content::Text(prompts::system_prompt(self.config.language)),
        }];

        let mut consecutive_parse_failures = 0u32;
        let mut step_number: u32 = 0;

        for iteration in 0..self.config.max_steps {
            if cancel.is_cancelled() {
                return self.terminal(TaskStatus::Stopped, "cancelled".into()).await;
            }

            let step_started = Instant::now();
            step_number += 1;

            let screenshot = match self.device.screenshot(&device_id, cancel).await {
                Ok(sc) => sc,
                Err(AgentError::Cancelled) => return self.terminal(TaskStatus::Stopped, "cancelled".into()).await,
                Err(e) => {
                    self.emit_error_step(step_number, &e, step_started.elapsed());
                    return self.terminal(TaskStatus::Error, format!("device failure: {e}")).await;
                }
            };

            let current_app = self.device.current_app(&device_id, cancel).await.unwrap_or_default();

            let mut user_text = prompts::screen_info(&current_app, self.config.language);
            if iteration == 0 {
                user_text = format!("{task_description}\n\n{user_text}");
            }
            let image_base64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &screenshot.png);
            context.push(Message {
                role: Role::User,
                content: Content::Multimodal { text: user_text, images_base64: vec![image_base64] },
            });

            let reply = match self.model.request(&context, cancel).await {
                Ok(reply) => reply,
                Err(AgentError::Cancelled) => return self.terminal(TaskStatus::Stopped, "cancelled".into()).await,
                Err(e) => {
                    self.emit_error_step(step_number, &e, step_started.elapsed());
                    return self.terminal(TaskStatus::Error, format!("model failure: {e}")).await;
                }
            };

            context.push(Message {
                role: Role::Assistant,
                content: Content::Text(format!("<think>{}</think><answer>{}</answer>", reply.thought, reply.action_text)),
            });

            let parsed = action::parse(&reply.action_text);
            let action = match parsed {
                Ok(action) => {
                    consecutive_parse_failures = 0;
                    action
                }
                Err(e) => {
                    consecutive_parse_failures += 1;
                    self.emit_step(StepRecord {
                        step_number,
                        task_id: self.task_id.clone(),
                        step_type: StepType::Error,
                        payload: serde_json::json!({"raw_action_text": reply.action_text}),
                        thought: Some(reply.thought.clone()),
                        outcome: ActionOutcome::Failure,
                        screenshot_ref: None,
                        elapsed_ms: step_started.elapsed().as_millis() as u64,
                        created_at: chrono::Utc::now(),
                    }, None, "parse_error", false, false);
                    if consecutive_parse_failures >= MAX_CONSECUTIVE_PARSE_FAILURES {
                        return self.terminal(TaskStatus::Error, format!("repeated malformed action text: {e}")).await;
                    }
                    continue;
                }
            };

            if let crate::action::types::Action::TakeOver { message } = &action {
                if let Err(e) = self.takeover.takeover(message, cancel).await {
                    if matches!(e, AgentError::Cancelled) {
                        return self.terminal(TaskStatus::Stopped, "cancelled".into()).await;
                    }
                    self.emit_error_step(step_number, &e, step_started.elapsed());
                    return self.terminal(TaskStatus::Error, format!("takeover failed: {e}")).await;
                }
            }

            let outcome = match self
                .dispatcher
                .execute(&action, &device_id, (screenshot.width, screenshot.height), cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(AgentError::Cancelled) => return self.terminal(TaskStatus::Stopped, "cancelled".into()).await,
                Err(e) => {
                    self.emit_error_step(step_number, &e, step_started.elapsed());
                    warn!(task_id = %self.task_id, step = step_number, error = %e, "action execution failed, continuing");
                    Outcome::failed(e.to_string())
                }
            };

            let action_label = action_label(&action);
            self.emit_step(StepRecord {
                step_number,
                task_id: self.task_id.clone(),
                step_type: StepType::Action,
                payload: serde_json::json!({"action": action_label}),
                thought: Some(reply.thought.clone()),
                outcome: if outcome.success { ActionOutcome::Success } else { ActionOutcome::Failure },
                screenshot_ref: None,
                elapsed_ms: step_started.elapsed().as_millis() as u64,
                created_at: chrono::Utc::now(),
            }, Some(screenshot.png.clone()), &action_label, outcome.success, outcome.should_finish);

            if outcome.should_finish {
                return self.terminal(TaskStatus::Completed, outcome.user_message.unwrap_or_default()).await;
            }
        }

        self.terminal(TaskStatus::Error, "step budget exhausted".into()).await
    }

    async fn resolve_device(&self) -> Result<String, AgentError> {
        if let Some(id) = &self.config.device_id {
            return Ok(id.clone());
        }
        let devices = self.connections.list_devices().await?;
        devices
            .into_iter()
            .find(|d| d.status == crate::types::DeviceStatus::Device)
            .map(|d| d.id)
            .ok_or(AgentError::NoDevice)
    }

    fn emit_error_step(&self, step_number: u32, error: &AgentError, elapsed: Duration) {
        self.emit_step(
            StepRecord {
                step_number,
                task_id: self.task_id.clone(),
                step_type: StepType::Error,
                payload: serde_json::json!({"error": error.to_string()}),
                thought: None,
                outcome: ActionOutcome::Failure,
                screenshot_ref: None,
                elapsed_ms: elapsed.as_millis() as u64,
                created_at: chrono::Utc::now(),
            },
            None,
            "error",
            false,
            false,
        );
    }

    fn emit_step(
        &self,
        record: StepRecord,
        screenshot_bytes: Option<Vec<u8>>,
        action_label: &str,
        success: bool,
        finished: bool,
    ) {
        let event = AgentEvent::StepUpdate {
            task_id: self.task_id.clone(),
            step_number: record.step_number,
            thought: record.thought.clone(),
            action: action_label.to_string(),
            outcome: record.outcome,
            screenshot_ref: record.screenshot_ref.clone(),
            success,
            finished,
        };
        self.tracker.append(record, screenshot_bytes);
        (self.event_sink)(event);
    }

    async fn terminal(&self, status: TaskStatus, message: String) -> AgentOutcome {
        self.tracker.flush(Some(FLUSH_GRACE)).await;
        info!(task_id = %self.task_id, ?status, %message, "task terminated");
        (self.event_sink)(AgentEvent::Terminal {
            task_id: self.task_id.clone(),
            status,
            message: message.clone(),
        });
        AgentOutcome { status, message: Some(message) }
    }
}

fn action_label(action: &crate::action::types::Action) -> String {
    use crate::action::types::Action;
    match action {
        Action::Launch { app } => format!("launch({app})"),
        Action::Tap { point, .. } => format!("tap({},{})", point.rx, point.ry),
        Action::DoubleTap { point } => format!("double_tap({},{})", point.rx, point.ry),
        Action::LongPress { point } => format!("long_press({},{})", point.rx, point.ry),
        Action::Swipe { start, end } => format!("swipe({},{} -> {},{})", start.rx, start.ry, end.rx, end.ry),
        Action::Type { text } => format!("type({text})"),
        Action::Back => "back".into(),
        Action::Home => "home".into(),
        Action::Wait { duration } => format!("wait({}ms)", duration.as_millis()),
        Action::TakeOver { message } => format!("take_over({message})"),
        Action::Finish { message } => format!("finish({message})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{AutoApprove, AutoCancelTakeover, AutoDeny, ConfirmationCallback};
    use crate::config::AppRegistryConfig;
    use crate::device::Key;
    use crate::model::ModelReply;
    use crate::store::InMemoryTaskStore;
    use crate::types::Screenshot;
    use std::sync::Mutex as SyncMutex;

    struct ScriptedModel {
        replies: SyncMutex<Vec<&'static str>>,
    }

    #[async_trait::async_trait]
    impl ModelBackend for ScriptedModel {
        async fn request(&self, _messages: &[Message], _cancel: &CancellationToken) -> Result<ModelReply, AgentError> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(AgentError::ModelPermanent("script exhausted".into()));
            }
            let action_text = replies.remove(0);
            Ok(ModelReply {
                thought: "thinking".into(),
                action_text: action_text.into(),
                raw: format!("<think>thinking</think><answer>{action_text}</answer>"),
                request_duration_ms: 1,
            })
        }
    }

    /// Never replies; blocks until cancelled, so tests can drive scenario 5
    /// (cancellation mid model-call) deterministically.
    struct SlowModel;

    #[async_trait::async_trait]
    impl ModelBackend for SlowModel {
        async fn request(&self, _messages: &[Message], cancel: &CancellationToken) -> Result<ModelReply, AgentError> {
            tokio::select! {
                _ = cancel.cancelled() => Err(AgentError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(30)) => unreachable!("test cancels well before this fires"),
            }
        }
    }

    struct NullBlobStore;
    #[async_trait::async_trait]
    impl crate::store::BlobStore for NullBlobStore {
        async fn put(&self, _key: &str, _bytes: Vec<u8>, _ct: &str) -> Result<String, AgentError> {
            Ok("file:///dev/null".into())
        }
        async fn delete(&self, _key: &str) -> Result<(), AgentError> {
            Ok(())
        }
    }

    /// Drives the full step loop without a real device or `adb`: every call
    /// succeeds deterministically and is logged so tests can assert on what
    /// was (or wasn't) dispatched.
    struct StubDevice {
        launch_ok: bool,
        calls: SyncMutex<Vec<String>>,
    }

    impl StubDevice {
        fn new() -> Self {
            Self { launch_ok: true, calls: SyncMutex::new(Vec::new()) }
        }

        fn log(&self, entry: impl Into<String>) {
            self.calls.lock().unwrap().push(entry.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl DeviceBackend for StubDevice {
        async fn screenshot(&self, _device_id: &str, _cancel: &CancellationToken) -> Result<Screenshot, AgentError> {
            Ok(Screenshot { png: vec![0u8; 16], width: 1080, height: 2400, sensitive: false, captured_at: chrono::Utc::now() })
        }

        async fn tap(&self, _device_id: &str, x: u32, y: u32, _cancel: &CancellationToken) -> Result<(), AgentError> {
            self.log(format!("tap({x},{y})"));
            Ok(())
        }

        async fn double_tap(&self, _device_id: &str, x: u32, y: u32, _cancel: &CancellationToken) -> Result<(), AgentError> {
            self.log(format!("double_tap({x},{y})"));
            Ok(())
        }

        async fn long_press(
            &self,
            _device_id: &str,
            x: u32,
            y: u32,
            _duration_ms: u64,
            _cancel: &CancellationToken,
        ) -> Result<(), AgentError> {
            self.log(format!("long_press({x},{y})"));
            Ok(())
        }

        async fn swipe(
            &self,
            _device_id: &str,
            x1: u32,
            y1: u32,
            x2: u32,
            y2: u32,
            _duration_ms: u64,
            _cancel: &CancellationToken,
        ) -> Result<(), AgentError> {
            self.log(format!("swipe({x1},{y1}->{x2},{y2})"));
            Ok(())
        }

        async fn key_event(&self, _device_id: &str, key: Key, _cancel: &CancellationToken) -> Result<(), AgentError> {
            self.log(format!("key({key:?})"));
            Ok(())
        }

        async fn type_text(&self, _device_id: &str, text: &str, _cancel: &CancellationToken) -> Result<(), AgentError> {
            self.log(format!("type({text})"));
            Ok(())
        }

        async fn launch_app(&self, _device_id: &str, package_id: &str, _cancel: &CancellationToken) -> Result<bool, AgentError> {
            self.log(format!("launch({package_id})"));
            Ok(self.launch_ok)
        }

        async fn current_app(&self, _device_id: &str, _cancel: &CancellationToken) -> Result<String, AgentError> {
            Ok(String::new())
        }
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("droidstep-agent-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn default_config() -> AgentConfig {
        AgentConfig { max_steps: 5, device_id: Some("emulator-5554".into()), language: Language::En, verbose: false, recording_enabled: false }
    }

    /// Builds an `Agent` over the given device/confirmation stubs, returning
    /// alongside it every `AgentEvent` it emits so scenario tests can assert
    /// on the StepEvent sequence without a live subscriber.
    fn capturing_agent(
        config: AgentConfig,
        model: Arc<dyn ModelBackend>,
        device: Arc<dyn DeviceBackend>,
        confirmation: Arc<dyn ConfirmationCallback>,
    ) -> (Agent, Arc<SyncMutex<Vec<AgentEvent>>>) {
        let events = Arc::new(SyncMutex::new(Vec::new()));
        let sink_events = events.clone();
        let apps = Arc::new(AppRegistry::new(&AppRegistryConfig::default()));
        let agent = Agent {
            task_id: "task-1".into(),
            config,
            connections: Arc::new(ConnectionManager::new()),
            device: device.clone(),
            apps: apps.clone(),
            model,
            dispatcher: Arc::new(ActionDispatcher::new(device, apps, confirmation)),
            takeover: Arc::new(AutoCancelTakeover),
            tracker: Arc::new(StepTracker::new(
                "task-1".into(),
                Arc::new(InMemoryTaskStore::new()),
                Arc::new(NullBlobStore),
                &tempdir(),
                Arc::new(|_| {}),
            )),
            event_sink: Arc::new(move |event| sink_events.lock().unwrap().push(event)),
        };
        (agent, events)
    }

    fn agent(config: AgentConfig, model: Arc<dyn ModelBackend>) -> Agent {
        capturing_agent(config, model, Arc::new(StubDevice::new()), Arc::new(AutoApprove)).0
    }

    fn step_events(events: &Arc<SyncMutex<Vec<AgentEvent>>>) -> Vec<AgentEvent> {
        events.lock().unwrap().iter().filter(|e| matches!(e, AgentEvent::StepUpdate { .. })).cloned().collect()
    }

    /// No `adb` binary is assumed to exist in the test environment. With no
    /// `device_id` configured, preflight falls through to
    /// `ConnectionManager::list_devices`, whose `adb devices -l` spawn fails
    /// deterministically, terminating the run as `error` before any model
    /// call happens.
    #[tokio::test]
    async fn missing_adb_binary_terminates_as_error_at_preflight() {
        let config = AgentConfig { max_steps: 5, device_id: None, language: Language::En, verbose: false, recording_enabled: false };
        let model: Arc<dyn ModelBackend> = Arc::new(ScriptedModel { replies: SyncMutex::new(vec![]) });
        let outcome = agent(config, model).run("open settings", &CancellationToken::new()).await;
        assert_eq!(outcome.status, TaskStatus::Error);
        assert!(outcome.message.unwrap().contains("preflight failed"));
    }

    #[tokio::test]
    async fn cancellation_observed_before_any_step_runs() {
        let config = default_config();
        let model: Arc<dyn ModelBackend> = Arc::new(ScriptedModel { replies: SyncMutex::new(vec![]) });
        let cancel = CancellationToken::new();
        cancel.cancel();
        // device_id is configured so preflight succeeds without touching
        // adb; the loop head then observes cancellation before any
        // screenshot/model call is attempted.
        let outcome = agent(config, model).run("open settings", &cancel).await;
        assert_eq!(outcome.status, TaskStatus::Stopped);
    }

    /// Scenario 1: single-step finish.
    #[tokio::test]
    async fn single_step_finish_emits_one_step_event_and_completes() {
        let model: Arc<dyn ModelBackend> = Arc::new(ScriptedModel { replies: SyncMutex::new(vec![r#"finish(message="ok")"#]) });
        let device = Arc::new(StubDevice::new());
        let (agent, events) = capturing_agent(default_config(), model, device.clone(), Arc::new(AutoApprove));
        let outcome = agent.run("say done", &CancellationToken::new()).await;

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.message.as_deref(), Some("ok"));
        let steps = step_events(&events);
        assert_eq!(steps.len(), 1);
        match &steps[0] {
            AgentEvent::StepUpdate { step_number, action, finished, .. } => {
                assert_eq!(*step_number, 1);
                assert_eq!(action, "finish(ok)");
                assert!(*finished);
            }
            other => panic!("expected StepUpdate, got {other:?}"),
        }
        assert!(device.calls().iter().all(|c| !c.starts_with("tap")));
    }

    /// Scenario 2: launch then finish.
    #[tokio::test]
    async fn launch_then_finish_resolves_app_and_completes() {
        let model: Arc<dyn ModelBackend> = Arc::new(ScriptedModel {
            replies: SyncMutex::new(vec![r#"do(action="Launch", app="微信")"#, r#"finish(message="done")"#]),
        });
        let device = Arc::new(StubDevice::new());
        let (agent, events) = capturing_agent(default_config(), model, device.clone(), Arc::new(AutoApprove));
        let outcome = agent.run("open wechat", &CancellationToken::new()).await;

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.message.as_deref(), Some("done"));
        assert_eq!(step_events(&events).len(), 2);
        assert_eq!(device.calls(), vec!["launch(com.tencent.mm)".to_string()]);
    }

    /// Scenario 3: sensitive tap denied.
    #[tokio::test]
    async fn sensitive_tap_denied_does_not_tap_and_loop_continues_to_finish() {
        let model: Arc<dyn ModelBackend> = Arc::new(ScriptedModel {
            replies: SyncMutex::new(vec![r#"do(action="Tap", element=[500,500], message="pay")"#, r#"finish(message="abort")"#]),
        });
        let device = Arc::new(StubDevice::new());
        let (agent, events) = capturing_agent(default_config(), model, device.clone(), Arc::new(AutoDeny));
        let outcome = agent.run("pay for something", &CancellationToken::new()).await;

        assert_eq!(outcome.status, TaskStatus::Completed);
        assert_eq!(outcome.message.as_deref(), Some("abort"));
        assert_eq!(step_events(&events).len(), 2);
        assert!(device.calls().is_empty(), "denied tap must never reach the device: {:?}", device.calls());
    }

    /// Scenario 4: budget exhaustion (P3).
    #[tokio::test]
    async fn budget_exhaustion_terminates_as_error_with_exactly_max_steps_events() {
        let config = AgentConfig { max_steps: 3, device_id: Some("emulator-5554".into()), language: Language::En, verbose: false, recording_enabled: false };
        let model: Arc<dyn ModelBackend> = Arc::new(ScriptedModel {
            replies: SyncMutex::new(vec![r#"do(action="Wait", duration="0 seconds")"#; 3]),
        });
        let (agent, events) = capturing_agent(config, model, Arc::new(StubDevice::new()), Arc::new(AutoApprove));
        let outcome = agent.run("wait forever", &CancellationToken::new()).await;

        assert_eq!(outcome.status, TaskStatus::Error);
        assert!(outcome.message.unwrap().to_lowercase().contains("budget"));
        assert_eq!(step_events(&events).len(), 3);
    }

    /// Scenario 5 / P4: cancellation while the model call is in flight stops
    /// the task quickly and persists no step for the interrupted iteration.
    #[tokio::test]
    async fn cancellation_during_model_call_stops_without_persisting_the_in_flight_step() {
        let (agent, events) = capturing_agent(default_config(), Arc::new(SlowModel), Arc::new(StubDevice::new()), Arc::new(AutoApprove));
        let cancel = CancellationToken::new();
        let cancel_for_run = cancel.clone();
        let handle = tokio::spawn(async move { agent.run("open settings", &cancel_for_run).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cancellation must be observed within 2s (P4)")
            .expect("agent task panicked");

        assert_eq!(outcome.status, TaskStatus::Stopped);
        assert!(step_events(&events).is_empty());
    }

    /// Scenario 6: parse storm — two malformed replies record error steps,
    /// the third hits the consecutive-failure limit and terminates.
    #[tokio::test]
    async fn parse_storm_terminates_as_error_after_max_consecutive_failures() {
        let model: Arc<dyn ModelBackend> =
            Arc::new(ScriptedModel { replies: SyncMutex::new(vec!["garbled()", "garbled()", "garbled()"]) });
        let (agent, events) = capturing_agent(default_config(), model, Arc::new(StubDevice::new()), Arc::new(AutoApprove));
        let outcome = agent.run("do something", &CancellationToken::new()).await;

        assert_eq!(outcome.status, TaskStatus::Error);
        assert!(outcome.message.unwrap().contains("malformed"));
        let error_steps = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, AgentEvent::StepUpdate { outcome: ActionOutcome::Failure, finished: false, .. }))
            .count();
        assert_eq!(error_steps, 2);
    }

    /// P1: step numbers observed are exactly 1..=n with no gaps or repeats.
    #[tokio::test]
    async fn step_numbers_are_monotonic_with_no_gaps() {
        let model: Arc<dyn ModelBackend> = Arc::new(ScriptedModel {
            replies: SyncMutex::new(vec![
                r#"do(action="Wait", duration="0 seconds")"#,
                r#"do(action="Wait", duration="0 seconds")"#,
                r#"finish(message="done")"#,
            ]),
        });
        let (agent, events) = capturing_agent(default_config(), model, Arc::new(StubDevice::new()), Arc::new(AutoApprove));
        agent.run("do steps", &CancellationToken::new()).await;

        let numbers: Vec<u32> = step_events(&events)
            .into_iter()
            .map(|e| match e {
                AgentEvent::StepUpdate { step_number, .. } => step_number,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    /// P2: exactly one terminal event per task, reachable as `completed`
    /// only through a `Finish` action.
    #[tokio::test]
    async fn exactly_one_terminal_event_is_emitted() {
        let model: Arc<dyn ModelBackend> = Arc::new(ScriptedModel { replies: SyncMutex::new(vec![r#"finish(message="ok")"#]) });
        let (agent, events) = capturing_agent(default_config(), model, Arc::new(StubDevice::new()), Arc::new(AutoApprove));
        agent.run("say done", &CancellationToken::new()).await;

        let terminal_count = events.lock().unwrap().iter().filter(|e| matches!(e, AgentEvent::Terminal { .. })).count();
        assert_eq!(terminal_count, 1);
    }
}
