//! Data types shared across the device, model, and agent layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    Usb,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Device,
    Unauthorized,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub connection_type: ConnectionType,
    pub status: DeviceStatus,
    pub model: Option<String>,
}

/// A captured screen. When the device refuses to hand over real pixels
/// (payment/DRM surfaces), `sensitive` is set and `png` is a synthesized
/// black placeholder of the declared dimensions.
#[derive(Clone)]
pub struct Screenshot {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sensitive: bool,
    pub captured_at: DateTime<Utc>,
}

impl std::fmt::Debug for Screenshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Screenshot")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sensitive", &self.sensitive)
            .field("bytes", &self.png.len())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thinking,
    Action,
    Screenshot,
    Error,
    Validation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failure,
    Pending,
    Skipped,
}

/// One loop iteration (spec §3 `StepRecord`). Created by `Agent`, appended
/// to `StepTracker`'s buffer, eventually persisted; never mutated after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: u32,
    pub task_id: String,
    pub step_type: StepType,
    pub payload: serde_json::Value,
    pub thought: Option<String>,
    pub outcome: ActionOutcome,
    pub screenshot_ref: Option<String>,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub session_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Subscriber-facing events (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    StepUpdate {
        task_id: String,
        step_number: u32,
        thought: Option<String>,
        action: String,
        outcome: ActionOutcome,
        screenshot_ref: Option<String>,
        success: bool,
        finished: bool,
    },
    Overflow {
        task_id: String,
        dropped_count: u64,
    },
    Terminal {
        task_id: String,
        status: TaskStatus,
        message: String,
    },
    /// Sent to a subscriber as the last event it will ever receive on this
    /// channel, right before it's dropped from the fan-out list for being
    /// too slow to keep up (spec §9).
    Disconnected {
        session_id: String,
    },
}
