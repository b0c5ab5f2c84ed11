use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

/// Administrative-division documents are tagged "H"; legal divisions "B".
const ADMINISTRATIVE_REGION: &str = "H";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodedArea {
    pub area_name: String,
    pub full_address: String,
}

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse_geocode(&self, lat: f64, lng: f64) -> AppResult<Option<GeocodedArea>>;
}

pub struct HttpReverseGeocoder {
    http: Client,
    endpoint: String,
    api_key: Option<SecretString>,
}

impl HttpReverseGeocoder {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Self::with_endpoint(
            config.geocoder_endpoint.clone(),
            config.geocoder_api_key.clone(),
            config.geocoder_timeout(),
        )
    }

    pub fn with_endpoint(
        endpoint: String,
        api_key: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("modi/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl ReverseGeocoder for HttpReverseGeocoder {
    async fn reverse_geocode(&self, lat: f64, lng: f64) -> AppResult<Option<GeocodedArea>> {
        #[derive(Deserialize)]
        struct Response {
            #[serde(default)]
            documents: Vec<RegionDocument>,
        }

        #[derive(Deserialize)]
        struct RegionDocument {
            region_type: Option<String>,
            address_name: Option<String>,
            region_3depth_name: Option<String>,
        }

        let mut request = self.http.get(&self.endpoint).query(&[
            ("x", lng.to_string()),
            ("y", lat.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.header(
                reqwest::header::AUTHORIZATION,
                format!("KakaoAK {}", key.expose_secret()),
            );
        }

        let response: Response = request.send().await?.error_for_status()?.json().await?;
        let mut documents = response.documents;
        let index = documents
            .iter()
            .position(|doc| doc.region_type.as_deref() == Some(ADMINISTRATIVE_REGION))
            .unwrap_or(0);
        if documents.is_empty() {
            return Ok(None);
        }
        let document = documents.swap_remove(index);

        let Some(area_name) = document
            .region_3depth_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
        else {
            return Ok(None);
        };
        let full_address = document
            .address_name
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or_else(|| area_name.clone());

        Ok(Some(GeocodedArea {
            area_name,
            full_address,
        }))
    }
}

pub(crate) fn describe_failure(err: &AppError) -> &'static str {
    match err {
        AppError::Http(http) if http.is_timeout() => "timeout",
        AppError::Http(http) if http.is_status() => "status",
        AppError::Http(_) => "transport",
        _ => "other",
    }
}
