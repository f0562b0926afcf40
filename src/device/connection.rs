//! Device discovery and USB/TCP connection lifecycle (spec §4.2).
//!
//! Drives `adb connect`/`adb tcpip`/`adb disconnect`/`adb devices -l`
//! through a small `Unknown → Connecting → {Connected, Failed}` state
//! machine per device, so a device can be dialed up over TCP/IP rather than
//! requiring a single preconfigured USB connection.

use crate::config::Language;
use crate::errors::AgentError;
use crate::types::DeviceInfo;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unknown,
    Connecting,
    Connected,
    Failed,
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionManager {
    state: Arc<DashMap<String, ConnState>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, address: &str, language: Language) -> (bool, String) {
        self.state.insert(address.to_string(), ConnState::Connecting);
        let output = run(&["connect", address]).await;
        match output {
            Ok(text) if text.contains("connected to") || text.contains("already connected") => {
                self.state.insert(address.to_string(), ConnState::Connected);
                info!(address, "adb connected");
                (true, localized(language, true, address))
            }
            Ok(text) => {
                self.state.insert(address.to_string(), ConnState::Failed);
                (false, text.trim().to_string())
            }
            Err(e) => {
                self.state.insert(address.to_string(), ConnState::Failed);
                (false, e.to_string())
            }
        }
    }

    pub async fn disconnect(&self, address: Option<&str>) -> (bool, String) {
        let args: Vec<&str> = match address {
            Some(addr) => vec!["disconnect", addr],
            None => vec!["disconnect"],
        };
        match run(&args).await {
            Ok(_) => {
                if let Some(addr) = address {
                    self.state.insert(addr.to_string(), ConnState::Disconnected);
                } else {
                    for mut entry in self.state.iter_mut() {
                        *entry.value_mut() = ConnState::Disconnected;
                    }
                }
                (true, "disconnected".to_string())
            }
            Err(e) => (false, e.to_string()),
        }
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, AgentError> {
        let raw = run(&["devices", "-l"]).await?;
        Ok(super::parse_devices_output(&raw))
    }

    pub async fn enable_tcpip(&self, port: u16, device_id: Option<&str>) -> (bool, String) {
        let mut args: Vec<String> = Vec::new();
        if let Some(id) = device_id {
            args.push("-s".into());
            args.push(id.into());
        }
        args.push("tcpip".into());
        args.push(port.to_string());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match run(&arg_refs).await {
            Ok(text) => (true, text.trim().to_string()),
            Err(e) => (false, e.to_string()),
        }
    }

    pub async fn get_device_ip(&self, device_id: Option<&str>) -> Result<String, AgentError> {
        let mut args: Vec<String> = Vec::new();
        if let Some(id) = device_id {
            args.push("-s".into());
            args.push(id.into());
        }
        args.extend(["shell", "ip", "route"].map(String::from));
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let raw = run(&arg_refs).await?;
        raw.split_whitespace()
            .last()
            .map(str::to_string)
            .ok_or_else(|| AgentError::AdbIOError("could not determine device IP".into()))
    }

    pub fn state_of(&self, address: &str) -> ConnState {
        self.state.get(address).map(|s| *s).unwrap_or(ConnState::Unknown)
    }
}

async fn run(args: &[&str]) -> Result<String, AgentError> {
    let output = tokio::time::timeout(Duration::from_secs(15), async {
        Command::new("adb")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    })
    .await
    .map_err(|_| AgentError::Timeout {
        op: args.join(" "),
        elapsed: Duration::from_secs(15),
    })?
    .map_err(|e| AgentError::AdbIOError(format!("failed to run adb: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(AgentError::AdbIOError(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

fn localized(language: Language, ok: bool, address: &str) -> String {
    match (language, ok) {
        (Language::Cn, true) => format!("已连接到 {address}"),
        (Language::Cn, false) => format!("连接 {address} 失败"),
        (Language::En, true) => format!("connected to {address}"),
        (Language::En, false) => format!("failed to connect to {address}"),
    }
}
