use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{DiaryApi, DiaryEntrySummary, ReminderApi};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::event_bus::{EventBus, Subscription};
use crate::flags::LocalFlags;
use crate::notify::{NotificationPermission, SystemNotification, SystemNotifier};
use crate::popup::{PopupPayload, PopupStore};
use crate::stabilizer::{AlertEvent, AlertKind};
use crate::telemetry::TelemetryClient;

pub const DEFAULT_EMOTION: &str = "neutral";
const NOTIFICATION_TITLE: &str = "Modi";
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Home,
    NotificationList,
    Other(String),
}

impl Route {
    pub fn parse(path: &str) -> Self {
        match path.trim_end_matches('/') {
            "" | "/home" => Route::Home,
            "/notification" | "/notifications" => Route::NotificationList,
            other => Route::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub diary_page_size: u32,
    pub reminder_limit: u32,
    pub discard_stale_enrichment: bool,
}

impl DispatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            diary_page_size: config.diary_enrichment_page_size.max(1),
            reminder_limit: config.recent_reminder_limit.max(1),
            discard_stale_enrichment: config.discard_stale_enrichment,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

struct DispatcherInner {
    diaries: Arc<dyn DiaryApi>,
    reminders: Arc<dyn ReminderApi>,
    notifier: Arc<dyn SystemNotifier>,
    flags: LocalFlags,
    popups: PopupStore,
    telemetry: Option<TelemetryClient>,
    settings: DispatchSettings,
    route: Mutex<Route>,
    latest_event: AtomicU64,
    reminder_check: tokio::sync::Mutex<()>,
}

/// Decides how a confirmed area entry reaches the user, and surfaces new
/// server-side reminders when the home screen is opened.
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<DispatcherInner>,
}

impl NotificationDispatcher {
    pub fn new(
        diaries: Arc<dyn DiaryApi>,
        reminders: Arc<dyn ReminderApi>,
        notifier: Arc<dyn SystemNotifier>,
        flags: LocalFlags,
        popups: PopupStore,
        settings: DispatchSettings,
        telemetry: Option<TelemetryClient>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                diaries,
                reminders,
                notifier,
                flags,
                popups,
                telemetry,
                settings,
                route: Mutex::new(Route::Home),
                latest_event: AtomicU64::new(0),
                reminder_check: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn popups(&self) -> &PopupStore {
        &self.inner.popups
    }

    pub fn current_route(&self) -> Route {
        self.inner.route.lock().clone()
    }

    /// Records the current screen. Opening the home screen schedules one
    /// reminder check, whose handle is returned.
    pub fn navigate(&self, route: Route) -> Option<JoinHandle<Option<PopupPayload>>> {
        let is_home = route == Route::Home;
        *self.inner.route.lock() = route;
        if !is_home {
            return None;
        }
        let dispatcher = self.clone();
        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(async move { dispatcher.check_new_reminders().await })),
            Err(_) => {
                warn!(target: "dispatcher", "no async runtime; skipping reminder check");
                None
            }
        }
    }

    /// Routes every `ENTER_AREA` on `bus` to [`Self::on_enter_area`].
    pub fn attach(
        &self,
        bus: &EventBus<AlertKind, AlertEvent>,
    ) -> AppResult<Subscription<AlertKind, AlertEvent>> {
        let handle = Handle::try_current()
            .map_err(|err| AppError::Config(format!("dispatcher needs a tokio runtime: {err}")))?;
        let dispatcher = self.clone();
        Ok(bus.subscribe(AlertKind::EnterArea, move |event: &AlertEvent| {
            let dispatcher = dispatcher.clone();
            let event = event.clone();
            handle.spawn(async move { dispatcher.on_enter_area(event).await });
            Ok(())
        }))
    }

    pub async fn on_enter_area(&self, event: AlertEvent) {
        let sequence = self.inner.latest_event.fetch_add(1, Ordering::SeqCst) + 1;

        if self.current_route() == Route::NotificationList {
            let notification = SystemNotification {
                title: NOTIFICATION_TITLE.to_string(),
                body: format!(
                    "You're back in {}. Open Modi to revisit your diary here.",
                    event.area
                ),
                tag: Some(format!("enter-area:{}", event.area)),
                icon: None,
            };
            if self.show_native(&notification) {
                self.record("native_notification_shown", json!({ "area": event.area }));
            }
            return;
        }

        let (days_since_last_visit, emotion) = match self
            .inner
            .diaries
            .diaries_by_area(&event.area, 0, self.inner.settings.diary_page_size)
            .await
        {
            Ok(page) => summarize_visits(&page.content, Utc::now()),
            Err(err) => {
                warn!(
                    target: "dispatcher",
                    area = %event.area,
                    error = ?err,
                    "diary enrichment failed; showing default popup"
                );
                (0, DEFAULT_EMOTION.to_string())
            }
        };

        if self.inner.settings.discard_stale_enrichment
            && self.inner.latest_event.load(Ordering::SeqCst) != sequence
        {
            debug!(target: "dispatcher", area = %event.area, "newer entry arrived; dropping stale popup");
            return;
        }

        let payload = PopupPayload {
            id: format!("area:{}:{}", event.area, event.timestamp_ms),
            area: event.area.clone(),
            days_since_last_visit,
            emotion,
            timestamp_ms: event.timestamp_ms,
        };
        info!(
            target: "dispatcher",
            area = %payload.area,
            days = payload.days_since_last_visit,
            "showing area popup"
        );
        self.record(
            "popup_shown",
            json!({ "area": payload.area, "days": payload.days_since_last_visit }),
        );
        self.inner.popups.show(payload);
    }

    /// Shows a popup for the newest server reminder if it is newer than the
    /// last one shown, then advances the watermark.
    pub async fn check_new_reminders(&self) -> Option<PopupPayload> {
        let _serialized = self.inner.reminder_check.lock().await;

        let reminders = match self
            .inner
            .reminders
            .recent_reminders(self.inner.settings.reminder_limit)
            .await
        {
            Ok(reminders) => reminders,
            Err(err) => {
                warn!(target: "dispatcher", error = ?err, "failed to fetch recent reminders");
                return None;
            }
        };

        let newest = reminders.into_iter().max_by_key(|reminder| reminder.id)?;
        let watermark = self.inner.flags.last_shown_reminder_id();
        if watermark.is_some_and(|seen| newest.id <= seen) {
            debug!(target: "dispatcher", id = newest.id, ?watermark, "no new reminder");
            return None;
        }

        let payload = PopupPayload {
            id: newest.id.to_string(),
            area: newest.address,
            days_since_last_visit: newest
                .last_visit
                .map(|visit| days_since(visit, Utc::now()))
                .unwrap_or(0),
            emotion: non_empty_emotion(newest.emotion),
            timestamp_ms: newest.created_at.timestamp_millis(),
        };
        self.inner.popups.show(payload.clone());
        if let Err(err) = self.inner.flags.set_last_shown_reminder_id(newest.id) {
            warn!(target: "dispatcher", id = newest.id, error = ?err, "failed to persist reminder watermark");
        }
        self.record("reminder_popup_shown", json!({ "reminder_id": newest.id }));
        Some(payload)
    }

    /// Persists the preference; enabling asks the OS when permission is
    /// still undecided.
    pub async fn set_notifications_enabled(&self, enabled: bool) -> AppResult<NotificationPermission> {
        let mut permission = self.inner.notifier.permission();
        if enabled && permission == NotificationPermission::Default {
            permission = self.inner.notifier.request_permission().await;
        }
        self.inner.flags.set_notifications_enabled(enabled)?;
        Ok(permission)
    }

    pub fn notification_permission(&self) -> NotificationPermission {
        self.inner.notifier.permission()
    }

    fn show_native(&self, notification: &SystemNotification) -> bool {
        let permission = self.inner.notifier.permission();
        if permission != NotificationPermission::Granted {
            debug!(target: "dispatcher", permission = permission.as_str(), "native notification skipped");
            return false;
        }
        if !self.inner.flags.notifications_enabled() {
            debug!(target: "dispatcher", "notifications disabled by user");
            return false;
        }
        match self.inner.notifier.show(notification) {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "dispatcher", error = ?err, "native notification failed");
                false
            }
        }
    }

    fn record(&self, name: &str, payload: serde_json::Value) {
        if let Some(telemetry) = &self.inner.telemetry {
            if let Err(err) = telemetry.record(name, payload) {
                warn!(target: "dispatcher", ?err, "failed to queue telemetry event");
            }
        }
    }
}

/// Whole days since `last`, rounded up. Future timestamps count as zero.
pub fn days_since(last: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let elapsed = (now - last).num_milliseconds();
    if elapsed <= 0 {
        return 0;
    }
    (elapsed + DAY_MS - 1) / DAY_MS
}

fn summarize_visits(entries: &[DiaryEntrySummary], now: DateTime<Utc>) -> (i64, String) {
    match entries.iter().max_by_key(|entry| entry.timestamp) {
        Some(latest) => (
            days_since(latest.timestamp, now),
            non_empty_emotion(latest.emotion.clone()),
        ),
        None => (0, DEFAULT_EMOTION.to_string()),
    }
}

fn non_empty_emotion(emotion: Option<String>) -> String {
    emotion
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_EMOTION.to_string())
}
