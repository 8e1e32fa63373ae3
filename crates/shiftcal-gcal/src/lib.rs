//! External calendar adapter: maps shift records to calendar events and back,
//! and wraps the event CRUD calls the reconciler needs.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use chrono_tz::Tz;
use shiftcal_core::{ShiftKey, ShiftRecord};
use thiserror::Error;
use tracing::debug;

pub mod description;
pub mod google;

pub use description::CodecError;
pub use google::{GoogleCalendarClient, ServiceAccountKey};

pub const CRATE_NAME: &str = "shiftcal-gcal";

/// An event as the calendar service reports it. `id` is assigned by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalEvent {
    pub id: String,
    pub summary: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub description: Option<String>,
    pub location: Option<String>,
}

/// Event payload for creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub summary: String,
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    pub description: String,
    pub location: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("calendar transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("calendar authorization failed: {0}")]
    Auth(String),
    #[error("calendar api returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed calendar response: {0}")]
    Response(String),
    #[error("event {event_id} is not a shift event: {source}")]
    Decode {
        event_id: String,
        #[source]
        source: CodecError,
    },
}

/// Raw event CRUD against one calendar.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Every event starting at or after `since` (all events when `None`).
    async fn list_events(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalEvent>, AdapterError>;
    async fn insert_event(&self, event: &NewEvent) -> Result<ExternalEvent, AdapterError>;
    async fn patch_description(
        &self,
        event_id: &str,
        description: &str,
    ) -> Result<(), AdapterError>;
    async fn delete_event(&self, event_id: &str) -> Result<(), AdapterError>;
}

/// Fixed parts of every shift event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub shift_length: TimeDelta,
    pub location: String,
    pub timezone: Tz,
}

impl EventTemplate {
    pub fn description(&self, record: &ShiftRecord) -> String {
        description::encode(&record.key.label, &record.urls)
    }

    pub fn to_new_event(&self, record: &ShiftRecord) -> NewEvent {
        NewEvent {
            summary: record.key.label.clone(),
            start: record.key.start_time,
            end: record.key.start_time + self.shift_length,
            description: self.description(record),
            location: self.location.clone(),
        }
    }

    /// Recovers the shift an event was created from: key from title and start,
    /// urls from the description.
    pub fn to_record(&self, event: &ExternalEvent) -> Result<ShiftRecord, CodecError> {
        if event.summary.trim().is_empty() {
            return Err(CodecError::MissingTitle);
        }
        let decoded = description::decode(event.description.as_deref().unwrap_or_default())?;
        Ok(ShiftRecord {
            key: ShiftKey::new(event.start.with_timezone(&self.timezone), event.summary.clone()),
            urls: decoded.urls,
        })
    }
}

/// Shift-level view of an [`EventStore`].
pub struct ShiftEventAdapter<S> {
    store: S,
    template: EventTemplate,
    window_start: Option<DateTime<Utc>>,
}

impl<S: EventStore> ShiftEventAdapter<S> {
    pub fn new(store: S, template: EventTemplate) -> Self {
        Self {
            store,
            template,
            window_start: None,
        }
    }

    /// Restricts [`ShiftEventAdapter::list`] to events starting at or after `start`.
    pub fn with_window_start(mut self, start: DateTime<Utc>) -> Self {
        self.window_start = Some(start);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn template(&self) -> &EventTemplate {
        &self.template
    }

    /// Events in the window. Stores may also report events that started
    /// before the window and are still running; those are left out.
    pub async fn list(&self) -> Result<Vec<ExternalEvent>, AdapterError> {
        let mut events = self.store.list_events(self.window_start).await?;
        if let Some(start) = self.window_start {
            events.retain(|event| event.start >= start);
        }
        Ok(events)
    }

    pub fn decode(&self, event: &ExternalEvent) -> Result<ShiftRecord, AdapterError> {
        self.template
            .to_record(event)
            .map_err(|source| AdapterError::Decode {
                event_id: event.id.clone(),
                source,
            })
    }

    pub async fn create(&self, record: &ShiftRecord) -> Result<ExternalEvent, AdapterError> {
        let created = self.store.insert_event(&self.template.to_new_event(record)).await?;
        debug!(event_id = %created.id, label = %record.key.label, "created shift event");
        Ok(created)
    }

    /// Rewrites only the description; title, times and location stay as they are.
    pub async fn update(
        &self,
        event: &ExternalEvent,
        record: &ShiftRecord,
    ) -> Result<(), AdapterError> {
        self.store
            .patch_description(&event.id, &self.template.description(record))
            .await?;
        debug!(event_id = %event.id, urls = record.urls.len(), "updated shift event");
        Ok(())
    }

    pub async fn delete(&self, event: &ExternalEvent) -> Result<(), AdapterError> {
        self.store.delete_event(&event.id).await?;
        debug!(event_id = %event.id, summary = %event.summary, "deleted shift event");
        Ok(())
    }
}
