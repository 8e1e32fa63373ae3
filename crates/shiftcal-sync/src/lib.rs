//! Sync run orchestration: configuration, the scrape phase, the reconcile
//! phase and the optional cron scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use shiftcal_fetch::{Credentials, FetchError, HttpClientConfig, MemberSession};
use shiftcal_gcal::{
    AdapterError, EventTemplate, GoogleCalendarClient, ServiceAccountKey, ShiftEventAdapter,
};
use shiftcal_scrape::{
    category_chains, scrape_chains, PageParser, ParseError, ParserConfig, ScrapeError,
    ScrapeOutcome,
};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

pub mod reconcile;

pub use reconcile::{
    plan, DuplicateTieBreak, ReconcileMode, ReconcilePlan, ReconcileSummary, Reconciler,
};

pub const CRATE_NAME: &str = "shiftcal-sync";

pub const DEFAULT_BASE_URL: &str = "https://members.foodcoop.com";
pub const DEFAULT_LOCATION: &str = "Park Slope Food Coop";
pub const DEFAULT_CATEGORY_PAGES: usize = 6;
pub const DEFAULT_SHIFT_MINUTES: i64 = 165;
pub const DEFAULT_SYNC_CRON: &str = "15 */4 * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("loading service account credentials: {0:#}")]
    Credentials(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("member site: {0}")]
    Fetch(#[from] FetchError),
    #[error("calendar markup: {0}")]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}

/// The calendar a run writes to and the key it authenticates with.
#[derive(Debug, Clone)]
pub struct CalendarTarget {
    pub calendar_id: String,
    pub service_account_path: PathBuf,
}

impl CalendarTarget {
    fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            calendar_id: required(lookup, "SHIFTCAL_CALENDAR_ID")?,
            service_account_path: required(lookup, "GOOGLE_APPLICATION_CREDENTIALS")?.into(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub base_url: Url,
    pub credentials: Credentials,
    pub category_pages: usize,
    pub weeks_per_category: usize,
    pub shift_length: TimeDelta,
    pub location: String,
    pub timezone: Tz,
    /// `None` when loaded for scraping only.
    pub calendar: Option<CalendarTarget>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub tie_break: DuplicateTieBreak,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn required<F>(lookup: &F, var: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(var))
}

fn parsed<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Like [`SyncConfig::from_env`] without requiring the calendar settings.
    pub fn scrape_only_from_env() -> Result<Self, ConfigError> {
        Self::scrape_only_from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the full configuration from any variable lookup; missing
    /// required values and malformed optional ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::scrape_only_from_lookup(&lookup)?;
        config.calendar = Some(CalendarTarget::from_lookup(&lookup)?);
        Ok(config)
    }

    pub fn scrape_only_from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credentials = Credentials {
            username: required(&lookup, "SHIFTCAL_USERNAME")?,
            password: required(&lookup, "SHIFTCAL_PASSWORD")?,
        };

        let default_base_url = Url::parse(DEFAULT_BASE_URL).map_err(|e| ConfigError::Invalid {
            var: "SHIFTCAL_BASE_URL",
            value: DEFAULT_BASE_URL.to_string(),
            reason: e.to_string(),
        })?;
        let base_url: Url = parsed(&lookup, "SHIFTCAL_BASE_URL", default_base_url)?;
        let shift_minutes: i64 = parsed(&lookup, "SHIFTCAL_SHIFT_MINUTES", DEFAULT_SHIFT_MINUTES)?;
        if shift_minutes <= 0 {
            return Err(ConfigError::Invalid {
                var: "SHIFTCAL_SHIFT_MINUTES",
                value: shift_minutes.to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let weeks_per_category: usize = parsed(&lookup, "SHIFTCAL_WEEKS_PER_CATEGORY", 1)?;
        if weeks_per_category == 0 {
            return Err(ConfigError::Invalid {
                var: "SHIFTCAL_WEEKS_PER_CATEGORY",
                value: "0".to_string(),
                reason: "at least one week is scraped per category".to_string(),
            });
        }
        let tie_break_value = lookup("SHIFTCAL_DUPLICATE_TIE_BREAK");
        let tie_break = match tie_break_value.as_deref().map(str::trim) {
            None | Some("") | Some("first-listed") => DuplicateTieBreak::FirstListed,
            Some("lowest-id") => DuplicateTieBreak::LowestEventId,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "SHIFTCAL_DUPLICATE_TIE_BREAK",
                    value: other.to_string(),
                    reason: "expected first-listed or lowest-id".to_string(),
                })
            }
        };

        Ok(Self {
            base_url,
            credentials,
            category_pages: parsed(&lookup, "SHIFTCAL_CATEGORY_PAGES", DEFAULT_CATEGORY_PAGES)?,
            weeks_per_category,
            shift_length: TimeDelta::minutes(shift_minutes),
            location: lookup("SHIFTCAL_LOCATION")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            timezone: parsed(&lookup, "SHIFTCAL_TIMEZONE", chrono_tz::America::New_York)?,
            calendar: None,
            user_agent: lookup("SHIFTCAL_USER_AGENT")
                .unwrap_or_else(|| format!("shiftcal/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: parsed(&lookup, "SHIFTCAL_HTTP_TIMEOUT_SECS", 20)?,
            tie_break,
            scheduler_enabled: lookup("SHIFTCAL_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("SHIFTCAL_SYNC_CRON")
                .unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }

    /// The calendar settings, required by anything that reconciles.
    pub fn calendar(&self) -> Result<&CalendarTarget, ConfigError> {
        self.calendar
            .as_ref()
            .ok_or(ConfigError::Missing("SHIFTCAL_CALENDAR_ID"))
    }

    pub fn event_template(&self) -> EventTemplate {
        EventTemplate {
            shift_length: self.shift_length,
            location: self.location.clone(),
            timezone: self.timezone,
        }
    }
}

/// Midnight of `now`'s local date; the calendar is only reconciled from here on.
pub fn window_start(now: DateTime<Utc>, timezone: Tz) -> DateTime<Tz> {
    let local = now.with_timezone(&timezone);
    local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| timezone.from_local_datetime(&midnight).earliest())
        .unwrap_or(local)
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: usize,
    pub shifts_parsed: usize,
    pub listings_parsed: usize,
    #[serde(flatten)]
    pub reconcile: ReconcileSummary,
}

pub struct SyncPipeline {
    config: SyncConfig,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Logs in, scrapes every category chain and releases the session before
    /// returning.
    pub async fn scrape(&self) -> Result<ScrapeOutcome, SyncError> {
        let session = MemberSession::new(
            self.config.base_url.clone(),
            HttpClientConfig {
                timeout: Duration::from_secs(self.config.http_timeout_secs),
                user_agent: Some(self.config.user_agent.clone()),
                ..Default::default()
            },
        )?;
        session.login(&self.config.credentials).await?;

        let parser = PageParser::new(ParserConfig::new(
            self.config.base_url.clone(),
            self.config.timezone,
        ))?;
        let today = Utc::now().with_timezone(&self.config.timezone).date_naive();
        let chains = category_chains(
            &self.config.base_url,
            self.config.category_pages,
            self.config.weeks_per_category,
            today,
        )?;

        let outcome = scrape_chains(&session, &parser, &chains).await?;
        drop(session);
        Ok(outcome)
    }

    pub async fn run_once(&self, mode: ReconcileMode) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, ?mode, "starting shift sync");

        // Credentials are checked before any scraping starts.
        let calendar = self.config.calendar()?;
        let key = ServiceAccountKey::from_file(&calendar.service_account_path)
            .map_err(ConfigError::Credentials)?;
        let client = GoogleCalendarClient::new(key, calendar.calendar_id.clone())?;

        let window = window_start(started_at, self.config.timezone);
        let mut scraped = self.scrape().await?;
        let pages = scraped.pages;
        let shifts_parsed = scraped.shifts.len();
        let listings_parsed = scraped.shifts.listing_count();
        scraped.shifts.retain_from(&window);

        let adapter = ShiftEventAdapter::new(client, self.config.event_template())
            .with_window_start(window.with_timezone(&Utc));
        let reconciler = Reconciler::new(adapter).with_tie_break(self.config.tie_break);
        let reconcile = reconciler.reconcile(&scraped.shifts, mode).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages,
            shifts_parsed,
            listings_parsed,
            reconcile,
        };
        info!(
            %run_id,
            shifts = summary.shifts_parsed,
            added = summary.reconcile.added,
            updated = summary.reconcile.updated,
            removed = summary.reconcile.removed,
            "shift sync finished"
        );
        Ok(summary)
    }
}

/// Scheduler that re-runs the pipeline on `sync_cron`, or `None` when
/// scheduling is disabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
) -> anyhow::Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = pipeline.config.sync_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once(ReconcileMode::Apply).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync complete"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env(mode: ReconcileMode) -> Result<SyncRunSummary, SyncError> {
    let config = SyncConfig::from_env()?;
    SyncPipeline::new(config).run_once(mode).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("SHIFTCAL_USERNAME", "12345"),
        ("SHIFTCAL_PASSWORD", "secret"),
        ("SHIFTCAL_CALENDAR_ID", "abc@group.calendar.google.com"),
        ("GOOGLE_APPLICATION_CREDENTIALS", "/tmp/key.json"),
    ];

    #[test]
    fn defaults_fill_optional_settings() {
        let config = SyncConfig::from_lookup(lookup(REQUIRED)).unwrap();
        assert_eq!(config.base_url.as_str(), "https://members.foodcoop.com/");
        assert_eq!(config.category_pages, 6);
        assert_eq!(config.weeks_per_category, 1);
        assert_eq!(config.shift_length, TimeDelta::minutes(165));
        assert_eq!(config.location, "Park Slope Food Coop");
        assert_eq!(config.timezone, chrono_tz::America::New_York);
        assert_eq!(config.tie_break, DuplicateTieBreak::FirstListed);
        assert!(!config.scheduler_enabled);
        let calendar = config.calendar().unwrap();
        assert_eq!(calendar.calendar_id, "abc@group.calendar.google.com");
        assert_eq!(calendar.service_account_path, PathBuf::from("/tmp/key.json"));
    }

    #[test]
    fn scraping_does_not_need_calendar_settings() {
        let config = SyncConfig::scrape_only_from_lookup(lookup(&REQUIRED[..2])).unwrap();
        assert!(config.calendar.is_none());
        assert!(matches!(
            config.calendar(),
            Err(ConfigError::Missing("SHIFTCAL_CALENDAR_ID"))
        ));

        let err = SyncConfig::from_lookup(lookup(&REQUIRED[..2])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SHIFTCAL_CALENDAR_ID")));
    }

    #[test]
    fn missing_required_values_are_config_errors() {
        let err = SyncConfig::from_lookup(lookup(&REQUIRED[1..])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SHIFTCAL_USERNAME")));

        let mut vars = REQUIRED
            .iter()
            .copied()
            .filter(|(var, _)| *var != "SHIFTCAL_CALENDAR_ID")
            .collect::<Vec<_>>();
        vars.push(("SHIFTCAL_CALENDAR_ID", "  "));
        let err = SyncConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SHIFTCAL_CALENDAR_ID")));
    }

    #[test]
    fn malformed_optional_values_are_rejected() {
        for (var, value) in [
            ("SHIFTCAL_CATEGORY_PAGES", "six"),
            ("SHIFTCAL_TIMEZONE", "Mars/Olympus"),
            ("SHIFTCAL_SHIFT_MINUTES", "0"),
            ("SHIFTCAL_WEEKS_PER_CATEGORY", "0"),
            ("SHIFTCAL_DUPLICATE_TIE_BREAK", "random"),
        ] {
            let mut vars = REQUIRED.to_vec();
            vars.push((var, value));
            let err = SyncConfig::from_lookup(lookup(&vars)).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { var: v, .. } if v == var),
                "{var}={value} gave {err}"
            );
        }
    }

    #[test]
    fn overrides_are_honoured() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("SHIFTCAL_TIMEZONE", "America/Chicago"),
            ("SHIFTCAL_WEEKS_PER_CATEGORY", "3"),
            ("SHIFTCAL_DUPLICATE_TIE_BREAK", "lowest-id"),
            ("SHIFTCAL_SCHEDULER_ENABLED", "true"),
        ]);
        let config = SyncConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.timezone, chrono_tz::America::Chicago);
        assert_eq!(config.weeks_per_category, 3);
        assert_eq!(config.tie_break, DuplicateTieBreak::LowestEventId);
        assert!(config.scheduler_enabled);
        assert_eq!(config.event_template().timezone, chrono_tz::America::Chicago);
    }

    #[test]
    fn window_starts_at_local_midnight() {
        let now = Utc.with_ymd_and_hms(2026, 10, 20, 2, 30, 0).unwrap();
        // 22:30 on the 19th in New York.
        let start = window_start(now, chrono_tz::America::New_York);
        assert_eq!(start.to_rfc3339(), "2026-10-19T00:00:00-04:00");
    }
}
