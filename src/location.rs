use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::flags::LocalFlags;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub lat: f64,
    pub lng: f64,
    pub timestamp_ms: i64,
}

impl PositionSample {
    pub fn new(lat: f64, lng: f64, timestamp_ms: i64) -> Self {
        Self {
            lat,
            lng,
            timestamp_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    Unavailable(String),
    #[error("position request timed out after {0:?}")]
    Timeout(Duration),
}

impl LocationError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, LocationError::PermissionDenied)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationError::PermissionDenied => "permission_denied",
            LocationError::Unavailable(_) => "unavailable",
            LocationError::Timeout(_) => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub maximum_age: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl PositionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            high_accuracy: config.location_high_accuracy,
            maximum_age: Duration::from_millis(config.location_maximum_age_ms),
            timeout: Duration::from_millis(config.location_timeout_ms),
            poll_interval: Duration::from_millis(config.location_poll_interval_ms.max(1)),
        }
    }
}

/// Device location capability. One call is one acquisition.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(
        &self,
        options: &PositionOptions,
    ) -> Result<PositionSample, LocationError>;
}

/// Receives the samples of one tracking loop, one at a time. A delivery may
/// overlap the `stop_tracking` call that ends the loop.
#[async_trait]
pub trait PositionSink: Send + Sync {
    async fn on_sample(&self, sample: PositionSample);

    fn on_error(&self, _error: &LocationError) {}
}

struct ActiveTracking {
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PositionSource {
    provider: Arc<dyn LocationProvider>,
    options: PositionOptions,
    flags: LocalFlags,
    generation: Arc<AtomicU64>,
    active: Mutex<Option<ActiveTracking>>,
}

impl PositionSource {
    pub fn new(
        provider: Arc<dyn LocationProvider>,
        options: PositionOptions,
        flags: LocalFlags,
    ) -> Self {
        Self {
            provider,
            options,
            flags,
            generation: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &PositionOptions {
        &self.options
    }

    /// Starts the polling loop, replacing any loop already running. Fails
    /// fast with `PermissionDenied` while the denial is cached.
    pub fn start_tracking(&self, sink: Arc<dyn PositionSink>) -> AppResult<()> {
        if self.flags.geolocation_denied() {
            debug!(target: "position_source", "permission denial cached; not prompting");
            return Err(LocationError::PermissionDenied.into());
        }

        let mut active = self.active.lock();
        if let Some(previous) = active.take() {
            previous.cancel.cancel();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.provider),
            self.options,
            self.flags.clone(),
            sink,
            Arc::clone(&self.generation),
            generation,
            cancel.clone(),
        ));
        info!(target: "position_source", generation, "tracking started");
        *active = Some(ActiveTracking {
            generation,
            cancel,
            task,
        });
        Ok(())
    }

    /// Stops the loop. Safe to call repeatedly.
    ///
    /// No acquisition starts after this returns, but on a multi-threaded
    /// runtime a sample that passed the generation check just before the
    /// call may still be inside [`PositionSink::on_sample`]. Sinks that need
    /// a hard cutoff keep their own stop flag, as
    /// [`crate::tracking::GeofenceSession`] does.
    pub fn stop_tracking(&self) {
        let Some(tracking) = self.active.lock().take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        tracking.cancel.cancel();
        info!(
            target: "position_source",
            generation = tracking.generation,
            "tracking stopped"
        );
    }

    pub fn is_tracking(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|tracking| !tracking.cancel.is_cancelled() && !tracking.task.is_finished())
            .unwrap_or(false)
    }

    /// Clears a cached denial so the next start prompts again.
    pub fn retry_permission(&self, sink: Arc<dyn PositionSink>) -> AppResult<()> {
        self.flags.clear_geolocation_denied()?;
        self.start_tracking(sink)
    }
}

impl Drop for PositionSource {
    fn drop(&mut self) {
        if let Some(tracking) = self.active.get_mut().take() {
            tracking.cancel.cancel();
        }
    }
}

async fn run_loop(
    provider: Arc<dyn LocationProvider>,
    options: PositionOptions,
    flags: LocalFlags,
    sink: Arc<dyn PositionSink>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut ticker = interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let is_current =
        || !cancel.is_cancelled() && current_generation.load(Ordering::SeqCst) == generation;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = timeout(options.timeout, provider.current_position(&options)) => {
                result.unwrap_or(Err(LocationError::Timeout(options.timeout)))
            }
        };

        if !is_current() {
            break;
        }

        match acquired {
            Ok(sample) => sink.on_sample(sample).await,
            Err(LocationError::PermissionDenied) => {
                warn!(target: "position_source", generation, "location permission denied; tracking halted");
                if let Err(err) = flags.mark_geolocation_denied() {
                    warn!(target: "position_source", error = ?err, "failed to cache permission denial");
                }
                sink.on_error(&LocationError::PermissionDenied);
                break;
            }
            Err(err) => {
                debug!(target: "position_source", generation, error = %err, "acquisition failed; waiting for next tick");
                sink.on_error(&err);
            }
        }
    }
    debug!(target: "position_source", generation, "tracking loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<PositionSample, LocationError>>>,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Result<PositionSample, LocationError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl LocationProvider for ScriptedProvider {
        async fn current_position(
            &self,
            _options: &PositionOptions,
        ) -> Result<PositionSample, LocationError> {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LocationError::Unavailable("script exhausted".into())))
        }
    }

    struct ChannelSink {
        samples: mpsc::UnboundedSender<PositionSample>,
        errors: mpsc::UnboundedSender<LocationError>,
    }

    #[async_trait]
    impl PositionSink for ChannelSink {
        async fn on_sample(&self, sample: PositionSample) {
            let _ = self.samples.send(sample);
        }

        fn on_error(&self, error: &LocationError) {
            let _ = self.errors.send(error.clone());
        }
    }

    fn channel_sink() -> (
        Arc<ChannelSink>,
        mpsc::UnboundedReceiver<PositionSample>,
        mpsc::UnboundedReceiver<LocationError>,
    ) {
        let (samples, sample_rx) = mpsc::unbounded_channel();
        let (errors, error_rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink { samples, errors }), sample_rx, error_rx)
    }

    fn options() -> PositionOptions {
        PositionOptions {
            high_accuracy: true,
            maximum_age: Duration::from_secs(0),
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_samples_and_survives_transient_errors() {
        let provider = ScriptedProvider::new(vec![
            Ok(PositionSample::new(37.5, 127.0, 1)),
            Err(LocationError::Unavailable("no fix".into())),
            Ok(PositionSample::new(37.6, 127.1, 2)),
        ]);
        let source = PositionSource::new(provider, options(), LocalFlags::in_memory());
        let (sink, mut samples, mut errors) = channel_sink();

        source.start_tracking(sink).unwrap();
        assert_eq!(samples.recv().await.unwrap().timestamp_ms, 1);
        assert!(matches!(
            errors.recv().await.unwrap(),
            LocationError::Unavailable(_)
        ));
        assert_eq!(samples.recv().await.unwrap().timestamp_ms, 2);
        assert!(source.is_tracking());
        source.stop_tracking();
        source.stop_tracking();
        assert!(!source.is_tracking());
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denial_is_sticky_until_retry() {
        let flags = LocalFlags::in_memory();
        let provider = ScriptedProvider::new(vec![
            Err(LocationError::PermissionDenied),
            Ok(PositionSample::new(37.5, 127.0, 9)),
        ]);
        let source = PositionSource::new(provider, options(), flags.clone());
        let (sink, mut samples, mut errors) = channel_sink();

        source.start_tracking(sink.clone()).unwrap();
        assert_eq!(errors.recv().await.unwrap(), LocationError::PermissionDenied);
        assert!(flags.geolocation_denied());

        let refused = source.start_tracking(sink.clone());
        assert!(matches!(
            refused,
            Err(crate::errors::AppError::Location(LocationError::PermissionDenied))
        ));

        source.retry_permission(sink).unwrap();
        assert_eq!(samples.recv().await.unwrap().timestamp_ms, 9);
        assert!(!flags.geolocation_denied());
        source.stop_tracking();
    }

    struct HangingProvider;

    #[async_trait]
    impl LocationProvider for HangingProvider {
        async fn current_position(
            &self,
            _options: &PositionOptions,
        ) -> Result<PositionSample, LocationError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_acquisitions_report_timeout() {
        let source = PositionSource::new(
            Arc::new(HangingProvider),
            options(),
            LocalFlags::in_memory(),
        );
        let (sink, _samples, mut errors) = channel_sink();
        source.start_tracking(sink).unwrap();
        assert_eq!(
            errors.recv().await.unwrap(),
            LocationError::Timeout(Duration::from_secs(5))
        );
        source.stop_tracking();
    }

    #[tokio::test(start_paused = true)]
    async fn no_samples_after_stop() {
        let provider = ScriptedProvider::new(
            (0..10)
                .map(|i| Ok(PositionSample::new(37.5, 127.0, i)))
                .collect(),
        );
        let source = PositionSource::new(provider, options(), LocalFlags::in_memory());
        let (sink, mut samples, _errors) = channel_sink();
        source.start_tracking(sink).unwrap();
        assert_eq!(samples.recv().await.unwrap().timestamp_ms, 0);
        source.stop_tracking();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(samples.try_recv().is_err());
    }
}
