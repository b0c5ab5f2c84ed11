use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::errors::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPermission {
    Default,
    Granted,
    Denied,
}

impl NotificationPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPermission::Default => "default",
            NotificationPermission::Granted => "granted",
            NotificationPermission::Denied => "denied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemNotification {
    pub title: String,
    pub body: String,
    /// Notifications sharing a tag replace each other.
    pub tag: Option<String>,
    pub icon: Option<String>,
}

/// OS notification capability.
#[async_trait]
pub trait SystemNotifier: Send + Sync {
    fn permission(&self) -> NotificationPermission;

    async fn request_permission(&self) -> NotificationPermission;

    fn show(&self, notification: &SystemNotification) -> AppResult<()>;
}

/// Headless notifier: emits notifications as log records.
pub struct TracingNotifier {
    permission: Mutex<NotificationPermission>,
    grant_on_request: bool,
}

impl TracingNotifier {
    pub fn new(grant_on_request: bool) -> Self {
        Self {
            permission: Mutex::new(NotificationPermission::Default),
            grant_on_request,
        }
    }
}

#[async_trait]
impl SystemNotifier for TracingNotifier {
    fn permission(&self) -> NotificationPermission {
        *self.permission.lock()
    }

    async fn request_permission(&self) -> NotificationPermission {
        let mut permission = self.permission.lock();
        if *permission == NotificationPermission::Default {
            *permission = if self.grant_on_request {
                NotificationPermission::Granted
            } else {
                NotificationPermission::Denied
            };
        }
        *permission
    }

    fn show(&self, notification: &SystemNotification) -> AppResult<()> {
        info!(
            target: "system_notification",
            title = %notification.title,
            body = %notification.body,
            tag = ?notification.tag,
            "notification shown"
        );
        Ok(())
    }
}

/// Notifier that keeps what it was asked to show, for tests and previews.
pub struct RecordingNotifier {
    permission: Mutex<NotificationPermission>,
    shown: Mutex<Vec<SystemNotification>>,
}

impl RecordingNotifier {
    pub fn new(permission: NotificationPermission) -> Self {
        Self {
            permission: Mutex::new(permission),
            shown: Mutex::new(Vec::new()),
        }
    }

    pub fn set_permission(&self, permission: NotificationPermission) {
        *self.permission.lock() = permission;
    }

    pub fn shown(&self) -> Vec<SystemNotification> {
        self.shown.lock().clone()
    }
}

#[async_trait]
impl SystemNotifier for RecordingNotifier {
    fn permission(&self) -> NotificationPermission {
        *self.permission.lock()
    }

    async fn request_permission(&self) -> NotificationPermission {
        let mut permission = self.permission.lock();
        if *permission == NotificationPermission::Default {
            *permission = NotificationPermission::Granted;
        }
        *permission
    }

    fn show(&self, notification: &SystemNotification) -> AppResult<()> {
        self.shown.lock().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_only_changes_undecided_permission() {
        let notifier = TracingNotifier::new(false);
        assert_eq!(notifier.permission(), NotificationPermission::Default);
        assert_eq!(
            notifier.request_permission().await,
            NotificationPermission::Denied
        );

        let granted = RecordingNotifier::new(NotificationPermission::Denied);
        assert_eq!(
            granted.request_permission().await,
            NotificationPermission::Denied
        );
    }
}
