//! Translates a parsed `Action` into `DeviceIO` calls and an `Outcome`
//! (spec §4.6), gating any action carrying a `sensitiveMessage` behind the
//! confirmation callback before it executes.
//!
//! Purely a translation layer: no network or model calls happen here.

use super::types::{Action, Outcome};
use crate::apps::AppRegistry;
use crate::callbacks::ConfirmationCallback;
use crate::device::{DeviceBackend, Key};
use crate::errors::AgentError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MAX_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_SWIPE_MS: u64 = 300;

pub struct ActionDispatcher {
    device: Arc<dyn DeviceBackend>,
    apps: Arc<AppRegistry>,
    confirmation: Arc<dyn ConfirmationCallback>,
}

impl ActionDispatcher {
    pub fn new(device: Arc<dyn DeviceBackend>, apps: Arc<AppRegistry>, confirmation: Arc<dyn ConfirmationCallback>) -> Self {
        Self { device, apps, confirmation }
    }

    pub async fn execute(
        &self,
        action: &Action,
        device_id: &str,
        screen: (u32, u32),
        cancel: &CancellationToken,
    ) -> Result<Outcome, AgentError> {
        let (width, height) = screen;
        match action {
            Action::Launch { app } => match self.apps.resolve(app) {
                None => Ok(Outcome::failed("app not supported")),
                Some(package_id) => {
                    let launched = self.device.launch_app(device_id, &package_id, cancel).await?;
                    if launched {
                        Ok(Outcome::ok(false, None))
                    } else {
                        Ok(Outcome::failed("app did not come to foreground"))
                    }
                }
            },
            Action::Tap { point, sensitive_message } => {
                if let Some(message) = sensitive_message {
                    if !self.confirmation.confirm(message).await {
                        return Ok(Outcome::ok(false, Some("user denied".into())));
                    }
                }
                let (x, y) = point.to_pixels(width, height);
                self.device.tap(device_id, x, y, cancel).await?;
                Ok(Outcome::ok(false, None))
            }
            Action::DoubleTap { point } => {
                let (x, y) = point.to_pixels(width, height);
                self.device.double_tap(device_id, x, y, cancel).await?;
                Ok(Outcome::ok(false, None))
            }
            Action::LongPress { point } => {
                let (x, y) = point.to_pixels(width, height);
                self.device.long_press(device_id, x, y, 700, cancel).await?;
                Ok(Outcome::ok(false, None))
            }
            Action::Swipe { start, end } => {
                let (x1, y1) = start.to_pixels(width, height);
                let (x2, y2) = end.to_pixels(width, height);
                self.device.swipe(device_id, x1, y1, x2, y2, DEFAULT_SWIPE_MS, cancel).await?;
                Ok(Outcome::ok(false, None))
            }
            Action::Type { text } => {
                self.device.type_text(device_id, text, cancel).await?;
                Ok(Outcome::ok(false, None))
            }
            Action::Back => {
                self.device.key_event(device_id, Key::Back, cancel).await?;
                Ok(Outcome::ok(false, None))
            }
            Action::Home => {
                self.device.key_event(device_id, Key::Home, cancel).await?;
                Ok(Outcome::ok(false, None))
            }
            Action::Wait { duration } => {
                let clamped = if *duration > MAX_WAIT {
                    warn!(requested_ms = duration.as_millis(), "clamping Wait action to 30s");
                    MAX_WAIT
                } else if duration.is_zero() {
                    warn!(requested_ms = duration.as_millis(), "clamping Wait action to 1ms");
                    Duration::from_millis(1)
                } else {
                    *duration
                };
                tokio::select! {
                    _ = cancel.cancelled() => Err(AgentError::Cancelled),
                    _ = tokio::time::sleep(clamped) => Ok(Outcome::ok(false, None)),
                }
            }
            Action::TakeOver { .. } => {
                // The caller (Agent) invokes the takeover callback directly,
                // since it may need to suspend the whole step loop rather
                // than a single DeviceIO call; the dispatcher only reports
                // the loop-continuation contract here.
                Ok(Outcome::ok(false, None))
            }
            Action::Finish { message } => Ok(Outcome::ok(true, Some(message.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::{AutoApprove, AutoDeny};
    use crate::config::AppRegistryConfig;

    fn dispatcher(confirm: Arc<dyn ConfirmationCallback>) -> ActionDispatcher {
        ActionDispatcher::new(
            Arc::new(crate::device::DeviceIO::new()),
            Arc::new(AppRegistry::new(&AppRegistryConfig::default())),
            confirm,
        )
    }

    #[tokio::test]
    async fn unsupported_app_does_not_finish() {
        let d = dispatcher(Arc::new(AutoApprove));
        let cancel = CancellationToken::new();
        let outcome = d
            .execute(&Action::Launch { app: "not a real app".into() }, "emulator-5554", (1080, 2400), &cancel)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(!outcome.should_finish);
    }

    #[tokio::test]
    async fn denied_sensitive_tap_does_not_finish_and_reports_denial() {
        let d = dispatcher(Arc::new(AutoDeny));
        let cancel = CancellationToken::new();
        let action = Action::Tap {
            point: crate::action::types::RelPoint::new(500, 500),
            sensitive_message: Some("pay".into()),
        };
        let outcome = d.execute(&action, "emulator-5554", (1080, 2400), &cancel).await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.should_finish);
        assert_eq!(outcome.user_message.as_deref(), Some("user denied"));
    }

    #[tokio::test]
    async fn finish_reports_should_finish() {
        let d = dispatcher(Arc::new(AutoApprove));
        let cancel = CancellationToken::new();
        let outcome = d
            .execute(&Action::Finish { message: "done".into() }, "emulator-5554", (1080, 2400), &cancel)
            .await
            .unwrap();
        assert!(outcome.should_finish);
        assert_eq!(outcome.user_message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn cancelled_wait_is_cancelled_error() {
        let d = dispatcher(Arc::new(AutoApprove));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = d
            .execute(&Action::Wait { duration: Duration::from_secs(5) }, "emulator-5554", (1080, 2400), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
