//! Google Calendar v3 REST client authenticated as a service account.

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;

use crate::{AdapterError, EventStore, ExternalEvent, NewEvent};

const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3/";
const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const PAGE_SIZE: &str = "250";

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// The fields of a service-account JSON key this client uses.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

impl ServiceAccountKey {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_json(&data).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        let key: Self = serde_json::from_str(data)?;
        EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .context("private_key is not an RSA PEM key")?;
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsPage {
    #[serde(default)]
    items: Vec<ApiEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEvent {
    id: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<String>,
    start: ApiEventTime,
    end: ApiEventTime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiEventTime {
    #[serde(default)]
    date_time: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiEventInsert<'a> {
    summary: &'a str,
    description: &'a str,
    location: &'a str,
    start: ApiEventTimeInsert,
    end: ApiEventTimeInsert,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiEventTimeInsert {
    date_time: String,
    time_zone: String,
}

#[derive(Debug, Serialize)]
struct ApiDescriptionPatch<'a> {
    description: &'a str,
}

impl TryFrom<ApiEvent> for ExternalEvent {
    type Error = AdapterError;

    fn try_from(event: ApiEvent) -> Result<Self, Self::Error> {
        let (Some(start), Some(end)) = (event.start.date_time, event.end.date_time) else {
            return Err(AdapterError::Response(format!(
                "event {} is an all-day event",
                event.id
            )));
        };
        Ok(ExternalEvent {
            id: event.id,
            summary: event.summary.unwrap_or_default(),
            start,
            end,
            description: event.description,
            location: event.location,
        })
    }
}

impl ApiEventTimeInsert {
    fn from_instant(instant: &DateTime<chrono_tz::Tz>) -> Self {
        Self {
            date_time: instant.to_rfc3339(),
            time_zone: instant.timezone().name().to_string(),
        }
    }
}

/// Event store backed by one Google calendar.
#[derive(Debug)]
pub struct GoogleCalendarClient {
    http: reqwest::Client,
    key: ServiceAccountKey,
    calendar_id: String,
    token: Mutex<Option<AccessToken>>,
}

impl GoogleCalendarClient {
    pub fn new(key: ServiceAccountKey, calendar_id: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("building calendar http client")?;
        Ok(Self {
            http,
            key,
            calendar_id: calendar_id.into(),
            token: Mutex::new(None),
        })
    }

    pub fn calendar_id(&self) -> &str {
        &self.calendar_id
    }

    fn events_url(&self, event_id: Option<&str>) -> Result<Url, AdapterError> {
        let mut url =
            Url::parse(CALENDAR_API).map_err(|e| AdapterError::Response(e.to_string()))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                AdapterError::Response("calendar api url cannot be a base".to_string())
            })?;
            segments
                .pop_if_empty()
                .extend(["calendars", self.calendar_id.as_str(), "events"]);
            if let Some(id) = event_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn signed_assertion(&self, now: DateTime<Utc>) -> Result<String, AdapterError> {
        let claims = Claims {
            iss: &self.key.client_email,
            scope: CALENDAR_SCOPE,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: (now + TimeDelta::hours(1)).timestamp(),
        };
        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| AdapterError::Auth(format!("loading service account key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| AdapterError::Auth(format!("signing token request: {e}")))
    }

    async fn access_token(&self) -> Result<String, AdapterError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - TimeDelta::seconds(60) > now {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.signed_assertion(now)?;
        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .instrument(info_span!("oauth_token", client = %self.key.client_email))
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AdapterError::Auth(format!("token endpoint returned {status}: {body}")));
        }
        let token: TokenResponse = resp.json().await?;
        let expires_at = now + TimeDelta::seconds(token.expires_in.unwrap_or(3600));
        debug!(%expires_at, "obtained calendar access token");

        *cached = Some(AccessToken {
            value: token.access_token.clone(),
            expires_at,
        });
        Ok(token.access_token)
    }

    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, AdapterError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(AdapterError::Auth(format!("{status}: {body}")))
            }
            _ => Err(AdapterError::Status {
                status: status.as_u16(),
                body,
            }),
        }
    }
}

#[async_trait]
impl EventStore for GoogleCalendarClient {
    async fn list_events(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalEvent>, AdapterError> {
        let url = self.events_url(None)?;
        let mut events = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.access_token().await?;
            let mut query = vec![
                ("singleEvents", "true".to_string()),
                ("showDeleted", "false".to_string()),
                ("maxResults", PAGE_SIZE.to_string()),
            ];
            if let Some(since) = since {
                query.push(("timeMin", since.to_rfc3339()));
            }
            if let Some(page_token) = &page_token {
                query.push(("pageToken", page_token.clone()));
            }

            let resp = self
                .http
                .get(url.clone())
                .bearer_auth(&token)
                .query(&query)
                .send()
                .instrument(info_span!("calendar_list", calendar = %self.calendar_id))
                .await?;
            let page: EventsPage = Self::checked(resp).await?.json().await?;
            for item in page.items {
                events.push(ExternalEvent::try_from(item)?);
            }

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!(count = events.len(), "listed calendar events");
        Ok(events)
    }

    async fn insert_event(&self, event: &NewEvent) -> Result<ExternalEvent, AdapterError> {
        let token = self.access_token().await?;
        let body = ApiEventInsert {
            summary: &event.summary,
            description: &event.description,
            location: &event.location,
            start: ApiEventTimeInsert::from_instant(&event.start),
            end: ApiEventTimeInsert::from_instant(&event.end),
        };
        let resp = self
            .http
            .post(self.events_url(None)?)
            .bearer_auth(&token)
            .json(&body)
            .send()
            .instrument(info_span!("calendar_insert", summary = %event.summary))
            .await?;
        let created: ApiEvent = Self::checked(resp).await?.json().await?;
        ExternalEvent::try_from(created)
    }

    async fn patch_description(
        &self,
        event_id: &str,
        description: &str,
    ) -> Result<(), AdapterError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .patch(self.events_url(Some(event_id))?)
            .bearer_auth(&token)
            .json(&ApiDescriptionPatch { description })
            .send()
            .instrument(info_span!("calendar_patch", event_id))
            .await?;
        Self::checked(resp).await?;
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), AdapterError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .delete(self.events_url(Some(event_id))?)
            .bearer_auth(&token)
            .send()
            .instrument(info_span!("calendar_delete", event_id))
            .await?;
        if resp.status() == StatusCode::GONE {
            warn!(event_id, "event already deleted");
            return Ok(());
        }
        Self::checked(resp).await?;
        Ok(())
    }
}
