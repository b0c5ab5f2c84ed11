use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";
const DEFAULT_GEOCODER_ENDPOINT: &str =
    "https://dapi.kakao.com/v2/local/geo/coord2regioncode.json";
const DEFAULT_COOLDOWN_MS: u64 = 30 * 60 * 1000;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base_url: String,
    pub api_timeout_ms: u64,
    pub api_token: Option<SecretString>,
    pub geocoder_endpoint: String,
    pub geocoder_timeout_ms: u64,
    pub geocoder_api_key: Option<SecretString>,
    pub location_high_accuracy: bool,
    pub location_maximum_age_ms: u64,
    pub location_timeout_ms: u64,
    pub location_poll_interval_ms: u64,
    pub geofence_min_displacement_m: f64,
    pub geofence_required_confirmations: u32,
    pub geofence_cooldown_ms: u64,
    pub diary_enrichment_page_size: u32,
    pub recent_reminder_limit: u32,
    pub discard_stale_enrichment: bool,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub database_file_name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub api_base_url: String,
    pub geocoder_endpoint: String,
    pub location_high_accuracy: bool,
    pub location_poll_interval_ms: u64,
    pub geofence_min_displacement_m: f64,
    pub geofence_required_confirmations: u32,
    pub geofence_cooldown_ms: u64,
    pub discard_stale_enrichment: bool,
    pub telemetry_enabled_by_default: bool,
    pub database_file_name: String,
    pub has_api_token: bool,
    pub has_geocoder_key: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_timeout_ms: 10_000,
            api_token: None,
            geocoder_endpoint: DEFAULT_GEOCODER_ENDPOINT.to_string(),
            geocoder_timeout_ms: 5_000,
            geocoder_api_key: None,
            location_high_accuracy: true,
            location_maximum_age_ms: 10_000,
            location_timeout_ms: 15_000,
            location_poll_interval_ms: 30_000,
            geofence_min_displacement_m: 40.0,
            geofence_required_confirmations: 2,
            geofence_cooldown_ms: DEFAULT_COOLDOWN_MS,
            diary_enrichment_page_size: 5,
            recent_reminder_limit: 5,
            discard_stale_enrichment: false,
            telemetry_enabled_by_default: true,
            telemetry_batch_size: 25,
            telemetry_buffer_max_bytes: DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            database_file_name: "modi-local.db".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            api_base_url: env::var("MODI_API_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base_url),
            api_timeout_ms: parse_u64("MODI_API_TIMEOUT_MS", defaults.api_timeout_ms),
            api_token: parse_secret("MODI_API_TOKEN"),
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.geocoder_endpoint),
            geocoder_timeout_ms: parse_u64("GEOCODER_TIMEOUT_MS", defaults.geocoder_timeout_ms),
            geocoder_api_key: parse_secret("GEOCODER_API_KEY"),
            location_high_accuracy: parse_bool(
                "LOCATION_HIGH_ACCURACY",
                defaults.location_high_accuracy,
            ),
            location_maximum_age_ms: parse_u64(
                "LOCATION_MAXIMUM_AGE_MS",
                defaults.location_maximum_age_ms,
            ),
            location_timeout_ms: parse_u64("LOCATION_TIMEOUT_MS", defaults.location_timeout_ms),
            location_poll_interval_ms: parse_u64(
                "LOCATION_POLL_INTERVAL_MS",
                defaults.location_poll_interval_ms,
            )
            .max(1),
            geofence_min_displacement_m: parse_f64(
                "GEOFENCE_MIN_DISPLACEMENT_M",
                defaults.geofence_min_displacement_m,
            ),
            geofence_required_confirmations: parse_u32(
                "GEOFENCE_REQUIRED_CONFIRMATIONS",
                defaults.geofence_required_confirmations,
            )
            .max(1),
            geofence_cooldown_ms: parse_u64("GEOFENCE_COOLDOWN_MS", defaults.geofence_cooldown_ms),
            diary_enrichment_page_size: parse_u32(
                "DIARY_ENRICHMENT_PAGE_SIZE",
                defaults.diary_enrichment_page_size,
            )
            .max(1),
            recent_reminder_limit: parse_u32("RECENT_REMINDER_LIMIT", defaults.recent_reminder_limit)
                .max(1),
            discard_stale_enrichment: parse_bool(
                "DISCARD_STALE_ENRICHMENT",
                defaults.discard_stale_enrichment,
            ),
            telemetry_enabled_by_default: parse_bool(
                "TELEMETRY_ENABLED",
                defaults.telemetry_enabled_by_default,
            ),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", defaults.telemetry_batch_size)
                .max(1),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                defaults.telemetry_buffer_max_bytes,
            ),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or(defaults.database_file_name),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            api_base_url: self.api_base_url.clone(),
            geocoder_endpoint: self.geocoder_endpoint.clone(),
            location_high_accuracy: self.location_high_accuracy,
            location_poll_interval_ms: self.location_poll_interval_ms,
            geofence_min_displacement_m: self.geofence_min_displacement_m,
            geofence_required_confirmations: self.geofence_required_confirmations,
            geofence_cooldown_ms: self.geofence_cooldown_ms,
            discard_stale_enrichment: self.discard_stale_enrichment,
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
            database_file_name: self.database_file_name.clone(),
            has_api_token: self.api_token.is_some(),
            has_geocoder_key: self.geocoder_api_key.is_some(),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_millis(self.geocoder_timeout_ms)
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}
