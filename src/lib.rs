pub mod api;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod event_bus;
pub mod flags;
pub mod geocode;
pub mod location;
pub mod notify;
pub mod popup;
pub mod stabilizer;
pub mod status;
pub mod telemetry;
pub mod tracking;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::{DiaryApi, ModiApiClient, ReminderApi};
use crate::config::AppConfig;
use crate::db::{bootstrap, DatabaseBootstrap, DatabaseContext};
use crate::dispatcher::{DispatchSettings, NotificationDispatcher, Route};
use crate::errors::AppResult;
use crate::event_bus::{EventBus, Subscription};
use crate::flags::{LocalFlags, SqliteFlagStore};
use crate::geocode::{HttpReverseGeocoder, ReverseGeocoder};
use crate::location::{LocationProvider, PositionOptions, PositionSink, PositionSource};
use crate::notify::{NotificationPermission, SystemNotifier, TracingNotifier};
use crate::popup::{PopupPayload, PopupStore};
use crate::stabilizer::{AlertEvent, AlertKind, StabilizerConfig};
use crate::status::PipelineStatus;
use crate::telemetry::TelemetryClient;
use crate::tracking::GeofenceSession;

pub use crate::errors::AppError;

/// Collaborators the pipeline talks to. [`ModiRuntime::initialize`] builds
/// the production set; tests pass their own.
pub struct RuntimeParts {
    pub diaries: Arc<dyn DiaryApi>,
    pub reminders: Arc<dyn ReminderApi>,
    pub geocoder: Arc<dyn ReverseGeocoder>,
    pub notifier: Arc<dyn SystemNotifier>,
    pub flags: LocalFlags,
    pub telemetry: Option<TelemetryClient>,
}

struct StorageInfo {
    path: PathBuf,
    recovered: bool,
}

struct ActiveTracking {
    source: PositionSource,
    session: Arc<GeofenceSession>,
}

impl ActiveTracking {
    fn stop(&self) {
        self.source.stop_tracking();
        self.session.stop();
    }
}

pub struct ModiRuntime {
    config: AppConfig,
    storage: Option<StorageInfo>,
    flags: LocalFlags,
    telemetry: Option<TelemetryClient>,
    geocoder: Arc<dyn ReverseGeocoder>,
    bus: EventBus<AlertKind, AlertEvent>,
    dispatcher: NotificationDispatcher,
    subscription: Mutex<Option<Subscription<AlertKind, AlertEvent>>>,
    tracking: Mutex<Option<ActiveTracking>>,
}

impl ModiRuntime {
    /// Builds the production pipeline rooted at `data_dir`. Must run inside a
    /// tokio runtime.
    pub fn initialize<P: AsRef<Path>>(config: AppConfig, data_dir: P) -> AppResult<Self> {
        init_tracing();
        let data_dir = data_dir.as_ref();
        let DatabaseBootstrap {
            context: DatabaseContext { connection, path },
            recovered,
        } = bootstrap(data_dir, &config.database_file_name)?;
        let store = SqliteFlagStore::new(Arc::new(Mutex::new(connection)));
        let telemetry = TelemetryClient::new(data_dir, &config)?;

        if let Err(err) = telemetry.record(
            "app_start",
            json!({
                "version": env!("CARGO_PKG_VERSION"),
                "db_recovered": recovered,
                "telemetry_enabled": config.telemetry_enabled_by_default,
            }),
        ) {
            warn!(?err, "failed to queue telemetry bootstrap event");
        }
        if let Err(err) = telemetry.flush() {
            warn!(?err, "failed to flush telemetry queue");
        }

        let api = Arc::new(ModiApiClient::new(&config)?);
        let parts = RuntimeParts {
            diaries: Arc::clone(&api) as Arc<dyn DiaryApi>,
            reminders: api,
            geocoder: Arc::new(HttpReverseGeocoder::new(&config)?),
            notifier: Arc::new(TracingNotifier::new(true)),
            flags: LocalFlags::new(Arc::new(store)),
            telemetry: Some(telemetry),
        };

        let mut runtime = Self::with_parts(config, parts)?;
        runtime.storage = Some(StorageInfo { path, recovered });
        Ok(runtime)
    }

    /// Wires the bus, popup store and dispatcher around `parts`. Must run
    /// inside a tokio runtime.
    pub fn with_parts(config: AppConfig, parts: RuntimeParts) -> AppResult<Self> {
        let bus = EventBus::new();
        let dispatcher = NotificationDispatcher::new(
            parts.diaries,
            parts.reminders,
            parts.notifier,
            parts.flags.clone(),
            PopupStore::new(),
            DispatchSettings::from_config(&config),
            parts.telemetry.clone(),
        );
        let subscription = dispatcher.attach(&bus)?;

        Ok(Self {
            config,
            storage: None,
            flags: parts.flags,
            telemetry: parts.telemetry,
            geocoder: parts.geocoder,
            bus,
            dispatcher,
            subscription: Mutex::new(Some(subscription)),
            tracking: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus<AlertKind, AlertEvent> {
        &self.bus
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn popups(&self) -> &PopupStore {
        self.dispatcher.popups()
    }

    /// Starts a fresh session fed by `provider`, ending any previous one.
    /// Cooldowns do not carry over between sessions.
    pub fn start_tracking(&self, provider: Arc<dyn LocationProvider>) -> AppResult<()> {
        let mut tracking = self.tracking.lock();
        if let Some(previous) = tracking.take() {
            previous.stop();
        }

        let session = self.new_session();
        let source = PositionSource::new(
            provider,
            PositionOptions::from_config(&self.config),
            self.flags.clone(),
        );
        let started = source.start_tracking(Arc::clone(&session) as Arc<dyn PositionSink>);
        *tracking = Some(ActiveTracking { source, session });
        started
    }

    pub fn stop_tracking(&self) {
        if let Some(active) = self.tracking.lock().take() {
            active.stop();
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking
            .lock()
            .as_ref()
            .map(|active| active.source.is_tracking())
            .unwrap_or(false)
    }

    /// Forgets a cached location denial and, when a provider is known,
    /// prompts again with a fresh session.
    pub fn retry_location_permission(&self) -> AppResult<()> {
        let mut tracking = self.tracking.lock();
        let Some(active) = tracking.as_mut() else {
            info!("no location provider yet; clearing cached denial only");
            return self.flags.clear_geolocation_denied();
        };
        active.session.stop();
        active.session = self.new_session();
        active.source.retry_permission(Arc::clone(&active.session) as Arc<dyn PositionSink>)
    }

    pub fn navigate(&self, route: Route) -> Option<JoinHandle<Option<PopupPayload>>> {
        self.dispatcher.navigate(route)
    }

    pub async fn set_notifications_enabled(
        &self,
        enabled: bool,
    ) -> AppResult<NotificationPermission> {
        self.dispatcher.set_notifications_enabled(enabled).await
    }

    pub fn status(&self) -> PipelineStatus {
        let candidate_area = self
            .tracking
            .lock()
            .as_ref()
            .and_then(|active| active.session.candidate_area());
        PipelineStatus::new(
            self.storage
                .as_ref()
                .map(|storage| storage.path.to_string_lossy().to_string()),
            self.storage.as_ref().is_some_and(|storage| storage.recovered),
            self.is_tracking(),
            self.flags.geolocation_denied(),
            candidate_area,
            self.popups().is_visible(),
            self.flags.notifications_enabled(),
            self.dispatcher.notification_permission(),
            self.flags.last_shown_reminder_id(),
            self.telemetry
                .as_ref()
                .map(|telemetry| telemetry.buffer_path().to_string_lossy().to_string()),
            self.telemetry
                .as_ref()
                .map(TelemetryClient::queue_depth)
                .unwrap_or(0),
            self.config.public_profile(),
        )
    }

    /// Stops tracking, detaches the dispatcher and flushes telemetry.
    pub fn shutdown(&self) {
        self.stop_tracking();
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.flush() {
                warn!(?err, "failed to flush telemetry queue");
            }
        }
    }

    fn new_session(&self) -> Arc<GeofenceSession> {
        GeofenceSession::new(
            Arc::clone(&self.geocoder),
            self.bus.clone(),
            StabilizerConfig::from_config(&self.config),
            self.telemetry.clone(),
        )
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,modi=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
