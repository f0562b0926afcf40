//! Every interaction with `adb` as a pure function of `(deviceId?, command)`.
//!
//! Shells out over `tokio::process::Command` with `kill_on_drop(true)` so a
//! cancellation token or timeout actually terminates the child, rather than
//! letting a blocking `Command::output()` run to completion regardless.

pub mod connection;
mod png;

use crate::errors::AgentError;
use crate::types::Screenshot;
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const INPUT_TIMEOUT: Duration = Duration::from_secs(5);
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(15);
const DUMPSYS_TIMEOUT: Duration = Duration::from_secs(5);

const FALLBACK_WIDTH: u32 = 1080;
const FALLBACK_HEIGHT: u32 = 2400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Back,
    Home,
    AppSwitch,
}

impl Key {
    fn keycode(self) -> &'static str {
        match self {
            Key::Back => "KEYCODE_BACK",
            Key::Home => "KEYCODE_HOME",
            Key::AppSwitch => "KEYCODE_APP_SWITCH",
        }
    }
}

/// The device-facing surface `Agent` and `ActionDispatcher` depend on.
/// `DeviceIO` is the only real implementation; tests substitute a stub so
/// the step loop can run without an attached device or `adb` on PATH.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    async fn screenshot(&self, device_id: &str, cancel: &CancellationToken) -> Result<Screenshot, AgentError>;
    async fn tap(&self, device_id: &str, x: u32, y: u32, cancel: &CancellationToken) -> Result<(), AgentError>;
    async fn double_tap(&self, device_id: &str, x: u32, y: u32, cancel: &CancellationToken) -> Result<(), AgentError>;
    async fn long_press(
        &self,
        device_id: &str,
        x: u32,
        y: u32,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError>;
    async fn swipe(
        &self,
        device_id: &str,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError>;
    async fn key_event(&self, device_id: &str, key: Key, cancel: &CancellationToken) -> Result<(), AgentError>;
    async fn type_text(&self, device_id: &str, text: &str, cancel: &CancellationToken) -> Result<(), AgentError>;
    async fn launch_app(&self, device_id: &str, package_id: &str, cancel: &CancellationToken) -> Result<bool, AgentError>;
    async fn current_app(&self, device_id: &str, cancel: &CancellationToken) -> Result<String, AgentError>;
}

/// Owns per-device serialization for `adb` subprocess calls (spec §4.1/§5,
/// P7): concurrent tasks on the same device never overlap their `adb`
/// invocations, while distinct devices proceed in parallel.
#[derive(Debug, Clone, Default)]
pub struct DeviceIO {
    device_locks: Arc<DashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DeviceIO {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
        self.device_locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub async fn screenshot(
        &self,
        device_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Screenshot, AgentError> {
        let captured_at = chrono::Utc::now();
        let bytes = self
            .run(device_id, &["exec-out", "screencap", "-p"], SCREENSHOT_TIMEOUT, cancel)
            .await?;

        match png::parse_ihdr(&bytes) {
            Some((width, height)) if is_non_black(&bytes) => Ok(Screenshot {
                png: bytes,
                width,
                height,
                sensitive: false,
                captured_at,
            }),
            _ => {
                debug!(device_id, "screencap returned an unusable frame; synthesizing black placeholder");
                Ok(Screenshot {
                    png: png::synth_black_png(FALLBACK_WIDTH, FALLBACK_HEIGHT),
                    width: FALLBACK_WIDTH,
                    height: FALLBACK_HEIGHT,
                    sensitive: true,
                    captured_at,
                })
            }
        }
    }

    pub async fn tap(&self, device_id: &str, x: u32, y: u32, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.run(
            device_id,
            &["shell", "input", "tap", &x.to_string(), &y.to_string()],
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
        settle(Duration::from_millis(400), cancel).await
    }

    pub async fn double_tap(&self, device_id: &str, x: u32, y: u32, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.tap(device_id, x, y, cancel).await?;
        self.tap(device_id, x, y, cancel).await
    }

    pub async fn long_press(
        &self,
        device_id: &str,
        x: u32,
        y: u32,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let duration_ms = duration_ms.max(500);
        self.run(
            device_id,
            &[
                "shell",
                "input",
                "swipe",
                &x.to_string(),
                &y.to_string(),
                &x.to_string(),
                &y.to_string(),
                &duration_ms.to_string(),
            ],
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
        settle(Duration::from_millis(400), cancel).await
    }

    pub async fn swipe(
        &self,
        device_id: &str,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.run(
            device_id,
            &[
                "shell",
                "input",
                "swipe",
                &x1.to_string(),
                &y1.to_string(),
                &x2.to_string(),
                &y2.to_string(),
                &duration_ms.to_string(),
            ],
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
        settle(Duration::from_millis(duration_ms.min(800)), cancel).await
    }

    pub async fn key_event(&self, device_id: &str, key: Key, cancel: &CancellationToken) -> Result<(), AgentError> {
        self.run(
            device_id,
            &["shell", "input", "keyevent", key.keycode()],
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
        settle(Duration::from_millis(300), cancel).await
    }

    /// Requires an IME that accepts `ADB_INPUT_TEXT` broadcasts to already be
    /// the active input method; fails with `InputMethodUnavailable` when the
    /// broadcast is not acknowledged.
    pub async fn type_text(&self, device_id: &str, text: &str, cancel: &CancellationToken) -> Result<(), AgentError> {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode(text);
        let set_ime = self
            .run(
                device_id,
                &["shell", "ime", "set", "com.android.adbkeyboard/.AdbIME"],
                INPUT_TIMEOUT,
                cancel,
            )
            .await;
        if set_ime.is_err() {
            return Err(AgentError::InputMethodUnavailable(
                "ADB keyboard IME is not installed/enabled on the device".into(),
            ));
        }
        self.run(
            device_id,
            &[
                "shell",
                "am",
                "broadcast",
                "-a",
                "ADB_INPUT_B64",
                "--es",
                "msg",
                &encoded,
            ],
            INPUT_TIMEOUT,
            cancel,
        )
        .await?;
        settle(Duration::from_millis(200), cancel).await
    }

    pub async fn launch_app(&self, device_id: &str, package_id: &str, cancel: &CancellationToken) -> Result<bool, AgentError> {
        self.run(
            device_id,
            &["shell", "monkey", "-p", package_id, "-c", "android.intent.category.LAUNCHER", "1"],
            LAUNCH_TIMEOUT,
            cancel,
        )
        .await?;
        settle(Duration::from_millis(800), cancel).await?;
        let current = self.current_app(device_id, cancel).await.unwrap_or_default();
        Ok(current == package_id)
    }

    /// Best-effort: returns an empty string rather than an error, matching
    /// the "non-critical" recovery rule in spec §7 for `currentApp` failures.
    pub async fn current_app(&self, device_id: &str, cancel: &CancellationToken) -> Result<String, AgentError> {
        let raw = self
            .run(device_id, &["shell", "dumpsys", "activity", "activities"], DUMPSYS_TIMEOUT, cancel)
            .await?;
        let text = String::from_utf8_lossy(&raw);
        Ok(parse_foreground_package(&text))
    }

    pub async fn list_devices(&self, cancel: &CancellationToken) -> Result<Vec<crate::types::DeviceInfo>, AgentError> {
        let raw = self.run_global(&["devices", "-l"], DUMPSYS_TIMEOUT, cancel).await?;
        let text = String::from_utf8_lossy(&raw);
        Ok(parse_devices_output(&text))
    }

    async fn run(
        &self,
        device_id: &str,
        args: &[&str],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, AgentError> {
        let lock = self.lock_for(device_id);
        let _guard = lock.lock().await;
        let mut full_args = vec!["-s", device_id];
        full_args.extend_from_slice(args);
        run_adb(&full_args, timeout, cancel).await
    }

    async fn run_global(&self, args: &[&str], timeout: Duration, cancel: &CancellationToken) -> Result<Vec<u8>, AgentError> {
        run_adb(args, timeout, cancel).await
    }
}

#[async_trait]
impl DeviceBackend for DeviceIO {
    async fn screenshot(&self, device_id: &str, cancel: &CancellationToken) -> Result<Screenshot, AgentError> {
        DeviceIO::screenshot(self, device_id, cancel).await
    }

    async fn tap(&self, device_id: &str, x: u32, y: u32, cancel: &CancellationToken) -> Result<(), AgentError> {
        DeviceIO::tap(self, device_id, x, y, cancel).await
    }

    async fn double_tap(&self, device_id: &str, x: u32, y: u32, cancel: &CancellationToken) -> Result<(), AgentError> {
        DeviceIO::double_tap(self, device_id, x, y, cancel).await
    }

    async fn long_press(
        &self,
        device_id: &str,
        x: u32,
        y: u32,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        DeviceIO::long_press(self, device_id, x, y, duration_ms, cancel).await
    }

    async fn swipe(
        &self,
        device_id: &str,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration_ms: u64,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        DeviceIO::swipe(self, device_id, x1, y1, x2, y2, duration_ms, cancel).await
    }

    async fn key_event(&self, device_id: &str, key: Key, cancel: &CancellationToken) -> Result<(), AgentError> {
        DeviceIO::key_event(self, device_id, key, cancel).await
    }

    async fn type_text(&self, device_id: &str, text: &str, cancel: &CancellationToken) -> Result<(), AgentError> {
        DeviceIO::type_text(self, device_id, text, cancel).await
    }

    async fn launch_app(&self, device_id: &str, package_id: &str, cancel: &CancellationToken) -> Result<bool, AgentError> {
        DeviceIO::launch_app(self, device_id, package_id, cancel).await
    }

    async fn current_app(&self, device_id: &str, cancel: &CancellationToken) -> Result<String, AgentError> {
        DeviceIO::current_app(self, device_id, cancel).await
    }
}

async fn run_adb(args: &[&str], timeout: Duration, cancel: &CancellationToken) -> Result<Vec<u8>, AgentError> {
    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }

    let child = Command::new("adb")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::AdbIOError(format!("failed to spawn adb: {e}")))?;

    let start = Instant::now();
    let wait = child.wait_with_output();
    tokio::pin!(wait);

    // `kill_on_drop` means abandoning `wait` here (falling out of `select!`
    // without polling it again) sends SIGKILL to the child before this
    // function returns.
    tokio::select! {
        _ = cancel.cancelled() => {
            Err(AgentError::Cancelled)
        }
        _ = tokio::time::sleep(timeout) => {
            Err(AgentError::Timeout { op: args.join(" "), elapsed: start.elapsed() })
        }
        result = &mut wait => {
            let output = result.map_err(|e| AgentError::AdbIOError(format!("adb I/O error: {e}")))?;
            if output.status.success() {
                Ok(output.stdout)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(classify_failure(&stderr))
            }
        }
    }
}

fn classify_failure(stderr: &str) -> AgentError {
    let lower = stderr.to_lowercase();
    if lower.contains("device not found") || lower.contains("no devices") {
        AgentError::DeviceNotFound(stderr.trim().to_string())
    } else if lower.contains("unauthorized") {
        AgentError::Unauthorized(stderr.trim().to_string())
    } else {
        AgentError::AdbIOError(stderr.trim().to_string())
    }
}

async fn settle(duration: Duration, cancel: &CancellationToken) -> Result<(), AgentError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// A fully-opaque-black frame (every color channel zero, alpha 255 where
/// present) is what a protected surface reports; anything else is real.
/// When the frame can't be decoded (unsupported bit depth/color type/
/// interlacing), it's treated as real rather than risk discarding data we
/// can't actually verify is a placeholder.
fn is_non_black(png_bytes: &[u8]) -> bool {
    !png::is_fully_opaque_black(png_bytes).unwrap_or(false)
}

fn parse_foreground_package(dumpsys: &str) -> String {
    for line in dumpsys.lines() {
        let line = line.trim();
        if line.starts_with("mResumedActivity:") || line.starts_with("topResumedActivity=") {
            if let Some(slash_pos) = line.find('/') {
                let before_slash = &line[..slash_pos];
                if let Some(space_pos) = before_slash.rfind([' ', '{']) {
                    return before_slash[space_pos + 1..].to_string();
                }
            }
        }
    }
    String::new()
}

pub(crate) fn parse_devices_output(raw: &str) -> Vec<crate::types::DeviceInfo> {
    use crate::types::{ConnectionType, DeviceInfo, DeviceStatus};

    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let mut parts = line.split_whitespace();
            let id = parts.next()?.to_string();
            let status_token = parts.next().unwrap_or("unknown");
            let status = match status_token {
                "device" => DeviceStatus::Device,
                "unauthorized" => DeviceStatus::Unauthorized,
                "offline" => DeviceStatus::Offline,
                _ => DeviceStatus::Unknown,
            };
            let model = parts
                .find_map(|field| field.strip_prefix("model:"))
                .map(|m| m.replace('_', " "));
            let connection_type = if id.contains(':') {
                ConnectionType::Tcp
            } else {
                ConnectionType::Usb
            };
            Some(DeviceInfo {
                id,
                connection_type,
                status,
                model,
            })
        })
        .collect()
}
