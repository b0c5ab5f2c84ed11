use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::AppConfig;
use crate::errors::AppResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaryEntrySummary {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaryPage {
    #[serde(default)]
    pub content: Vec<DiaryEntrySummary>,
    #[serde(default = "default_last")]
    pub last: bool,
}

fn default_last() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderSummary {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub address: String,
    #[serde(default)]
    pub last_visit: Option<DateTime<Utc>>,
    #[serde(default)]
    pub emotion: Option<String>,
}

#[async_trait]
pub trait DiaryApi: Send + Sync {
    async fn diaries_by_area(&self, area: &str, page: u32, size: u32) -> AppResult<DiaryPage>;
}

#[async_trait]
pub trait ReminderApi: Send + Sync {
    async fn recent_reminders(&self, limit: u32) -> AppResult<Vec<ReminderSummary>>;
}

pub struct ModiApiClient {
    http: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl ModiApiClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Self::with_base_url(
            config.api_base_url.clone(),
            config.api_token.clone(),
            config.api_timeout(),
        )
    }

    pub fn with_base_url(
        base_url: String,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(concat!("modi/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.http.get(format!("{}{path}", self.base_url));
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl DiaryApi for ModiApiClient {
    async fn diaries_by_area(&self, area: &str, page: u32, size: u32) -> AppResult<DiaryPage> {
        trace!(target: "modi_api", area, page, size, "listing diaries by area");
        let page = self
            .get("/diaries/location")
            .query(&[("dong", area)])
            .query(&[("page", page), ("size", size)])
            .send()
            .await?
            .error_for_status()?
            .json::<DiaryPage>()
            .await?;
        Ok(page)
    }
}

#[async_trait]
impl ReminderApi for ModiApiClient {
    async fn recent_reminders(&self, limit: u32) -> AppResult<Vec<ReminderSummary>> {
        trace!(target: "modi_api", limit, "fetching recent reminders");
        let reminders = self
            .get("/reminders/recent")
            .query(&[("limit", limit)])
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<ReminderSummary>>()
            .await?;
        Ok(reminders)
    }
}
