use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::event_bus::EventBus;
use crate::geocode::{describe_failure, ReverseGeocoder};
use crate::location::{LocationError, PositionSample, PositionSink};
use crate::stabilizer::{AlertEvent, AlertKind, GeofenceStabilizer, StabilizerConfig};
use crate::telemetry::TelemetryClient;

/// One tracking session: geocodes each sample, runs it through the session's
/// stabilizer and publishes confirmed entries.
pub struct GeofenceSession {
    geocoder: Arc<dyn ReverseGeocoder>,
    bus: EventBus<AlertKind, AlertEvent>,
    telemetry: Option<TelemetryClient>,
    stabilizer: Mutex<GeofenceStabilizer>,
    cancel: CancellationToken,
}

impl GeofenceSession {
    pub fn new(
        geocoder: Arc<dyn ReverseGeocoder>,
        bus: EventBus<AlertKind, AlertEvent>,
        config: StabilizerConfig,
        telemetry: Option<TelemetryClient>,
    ) -> Arc<Self> {
        Arc::new(Self {
            geocoder,
            bus,
            telemetry,
            stabilizer: Mutex::new(GeofenceStabilizer::new(config)),
            cancel: CancellationToken::new(),
        })
    }

    /// After this returns, no further sample changes the session state.
    pub fn stop(&self) {
        let mut stabilizer = self.stabilizer.lock();
        self.cancel.cancel();
        stabilizer.deactivate();
        stabilizer.reset();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn candidate_area(&self) -> Option<String> {
        self.stabilizer.lock().candidate_area().map(str::to_string)
    }

    pub async fn process(&self, sample: PositionSample) -> Option<AlertEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let area = match self.geocoder.reverse_geocode(sample.lat, sample.lng).await {
            Ok(area) => area.map(|area| area.area_name),
            Err(err) => {
                debug!(
                    target: "geofence",
                    error = ?err,
                    failure = describe_failure(&err),
                    "reverse geocoding failed; treating as no area"
                );
                None
            }
        };

        let event = {
            let mut stabilizer = self.stabilizer.lock();
            if self.cancel.is_cancelled() {
                return None;
            }
            stabilizer.on_sample(sample, area.as_deref())
        }?;

        info!(target: "geofence", area = %event.area, "entered area");
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.record("area_entered", json!({ "area": event.area })) {
                warn!(target: "geofence", ?err, "failed to queue telemetry event");
            }
        }
        self.bus.publish(&AlertKind::EnterArea, &event);
        Some(event)
    }
}

#[async_trait]
impl PositionSink for GeofenceSession {
    async fn on_sample(&self, sample: PositionSample) {
        self.process(sample).await;
    }

    fn on_error(&self, error: &LocationError) {
        if error.is_transient() {
            debug!(target: "geofence", error = %error, "position unavailable this tick");
        } else {
            warn!(target: "geofence", error = %error, "position source stopped");
        }
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.record("location_error", json!({ "kind": error.as_str() })) {
                warn!(target: "geofence", ?err, "failed to queue telemetry event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{AppError, AppResult};
    use crate::geocode::GeocodedArea;
    use tokio::sync::Notify;

    /// Maps latitude bands to areas: below 37.51 is "A", otherwise "B".
    /// Latitude exactly 0 fails like a network error.
    struct BandGeocoder;

    #[async_trait]
    impl ReverseGeocoder for BandGeocoder {
        async fn reverse_geocode(&self, lat: f64, _lng: f64) -> AppResult<Option<GeocodedArea>> {
            if lat == 0.0 {
                return Err(AppError::Api("geocoder offline".into()));
            }
            let name = if lat < 37.51 { "A" } else { "B" };
            Ok(Some(GeocodedArea {
                area_name: name.into(),
                full_address: format!("Seoul {name}"),
            }))
        }
    }

    /// Resolves every position to "B", one lookup per `release`.
    struct GatedGeocoder {
        gate: Notify,
    }

    impl GatedGeocoder {
        fn release(&self) {
            self.gate.notify_one();
        }
    }

    #[async_trait]
    impl ReverseGeocoder for GatedGeocoder {
        async fn reverse_geocode(&self, _lat: f64, _lng: f64) -> AppResult<Option<GeocodedArea>> {
            self.gate.notified().await;
            Ok(Some(GeocodedArea {
                area_name: "B".into(),
                full_address: "Seoul B".into(),
            }))
        }
    }

    fn session(bus: &EventBus<AlertKind, AlertEvent>) -> Arc<GeofenceSession> {
        GeofenceSession::new(
            Arc::new(BandGeocoder),
            bus.clone(),
            StabilizerConfig::default(),
            None,
        )
    }

    fn collect(bus: &EventBus<AlertKind, AlertEvent>) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _subscription = bus.subscribe(AlertKind::EnterArea, move |event: &AlertEvent| {
            sink.lock().push(event.area.clone());
            Ok(())
        });
        seen
    }

    #[tokio::test]
    async fn publishes_confirmed_entries() {
        let bus = EventBus::new();
        let seen = collect(&bus);
        let session = session(&bus);

        assert!(session.process(PositionSample::new(37.520, 127.0, 0)).await.is_none());
        let event = session
            .process(PositionSample::new(37.522, 127.0, 1_000))
            .await
            .unwrap();
        assert_eq!(event.area, "B");
        assert_eq!(*seen.lock(), vec!["B"]);
    }

    #[tokio::test]
    async fn geocode_failures_are_ignored() {
        let bus = EventBus::new();
        let seen = collect(&bus);
        let session = session(&bus);

        session.process(PositionSample::new(37.500, 127.0, 0)).await;
        session.process(PositionSample::new(0.0, 127.0, 500)).await;
        session.process(PositionSample::new(37.502, 127.0, 1_000)).await;
        assert_eq!(*seen.lock(), vec!["A"]);
    }

    #[tokio::test]
    async fn stopped_session_ignores_samples() {
        let bus = EventBus::new();
        let seen = collect(&bus);
        let session = session(&bus);

        session.process(PositionSample::new(37.520, 127.0, 0)).await;
        session.stop();
        assert!(session.is_stopped());
        session.process(PositionSample::new(37.522, 127.0, 1_000)).await;
        assert!(seen.lock().is_empty());
        assert_eq!(session.candidate_area(), None);
    }

    #[tokio::test]
    async fn lookup_finishing_after_stop_changes_nothing() {
        let bus = EventBus::new();
        let seen = collect(&bus);
        let geocoder = Arc::new(GatedGeocoder {
            gate: Notify::new(),
        });
        let session = GeofenceSession::new(
            Arc::clone(&geocoder) as Arc<dyn ReverseGeocoder>,
            bus.clone(),
            StabilizerConfig::default(),
            None,
        );

        geocoder.release();
        session.process(PositionSample::new(37.520, 127.0, 0)).await;
        assert_eq!(session.candidate_area(), Some("B".to_string()));

        let in_flight = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .process(PositionSample::new(37.522, 127.0, 1_000))
                    .await
            })
        };
        tokio::task::yield_now().await;
        session.stop();
        geocoder.release();

        assert!(in_flight.await.unwrap().is_none());
        assert!(seen.lock().is_empty());
        assert_eq!(session.candidate_area(), None);
    }
}
