use anyhow::Result;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::UiConfig;
use crate::error::Quack2TexError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyBackend {
    NotifySend,
    Kdialog,
    Zenity,
    /// Nothing installed; messages only go to the log.
    Log,
}

impl NotifyBackend {
    pub fn detect() -> Self {
        if which::which("notify-send").is_ok() {
            NotifyBackend::NotifySend
        } else if which::which("kdialog").is_ok() {
            NotifyBackend::Kdialog
        } else if which::which("zenity").is_ok() {
            NotifyBackend::Zenity
        } else {
            NotifyBackend::Log
        }
    }

    fn program(&self) -> Option<&'static str> {
        match self {
            NotifyBackend::NotifySend => Some("notify-send"),
            NotifyBackend::Kdialog => Some("kdialog"),
            NotifyBackend::Zenity => Some("zenity"),
            NotifyBackend::Log => None,
        }
    }

    fn args(&self, title: &str, message: &str, timeout_ms: u64, critical: bool) -> Vec<String> {
        let timeout_secs = (timeout_ms / 1000).max(1).to_string();
        match self {
            NotifyBackend::NotifySend => {
                let mut args = vec![
                    "--app-name".to_string(),
                    "Quack2Tex".to_string(),
                    "--expire-time".to_string(),
                    timeout_ms.to_string(),
                ];
                if critical {
                    args.extend(["--urgency".to_string(), "critical".to_string()]);
                }
                args.extend([title.to_string(), message.to_string()]);
                args
            }
            NotifyBackend::Kdialog => vec![
                "--passivepopup".to_string(),
                message.to_string(),
                timeout_secs,
                "--title".to_string(),
                title.to_string(),
            ],
            NotifyBackend::Zenity => vec![
                if critical { "--error" } else { "--info" }.to_string(),
                "--title".to_string(),
                title.to_string(),
                "--text".to_string(),
                message.to_string(),
                "--timeout".to_string(),
                timeout_secs,
            ],
            NotifyBackend::Log => Vec::new(),
        }
    }
}

/// Desktop notifications for errors the menu cannot show itself.
#[derive(Clone)]
pub struct UiManager {
    config: UiConfig,
    backend: NotifyBackend,
}

impl UiManager {
    pub fn with_config(config: &UiConfig) -> Self {
        let backend = NotifyBackend::detect();
        debug!("Notification backend: {:?}", backend);
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: &UiConfig, backend: NotifyBackend) -> Self {
        Self {
            config: config.clone(),
            backend,
        }
    }

    pub fn backend(&self) -> NotifyBackend {
        self.backend
    }

    pub async fn show_notification(&self, title: &str, message: &str) -> Result<()> {
        self.send(title, message, false).await
    }

    pub async fn show_error(&self, title: &str, error: &str) -> Result<()> {
        tracing::error!("{}: {}", title, error);
        self.send(title, error, true).await
    }

    /// Fires the notification from a background task so the caller never waits on it.
    /// Outside a runtime the error is only logged.
    pub fn spawn_error(&self, title: impl Into<String>, error: impl Into<String>) {
        let (title, error) = (title.into(), error.into());
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!("{}: {}", title, error);
            return;
        };
        let ui = self.clone();
        handle.spawn(async move {
            if let Err(e) = ui.show_error(&title, &error).await {
                warn!("Notification failed: {}", e);
            }
        });
    }

    async fn send(&self, title: &str, message: &str, critical: bool) -> Result<()> {
        let program = match self.backend.program() {
            Some(program) if self.config.show_notifications => program,
            _ => {
                info!("[Notification] {}: {}", title, message);
                return Ok(());
            }
        };

        let args = self
            .backend
            .args(title, message, self.config.notification_timeout_ms, critical);
        let output = Command::new(program)
            .args(&args)
            .output()
            .await
            .map_err(|e| Quack2TexError::Ui(format!("Failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("{} warning: {}", program, stderr.trim());
        }
        Ok(())
    }
}

impl Default for UiManager {
    fn default() -> Self {
        Self::with_config(&UiConfig::default())
    }
}
