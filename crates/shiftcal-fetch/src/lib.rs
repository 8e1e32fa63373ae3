//! Authenticated HTTP session for the member site: login, page fetches,
//! bounded concurrency and retry with backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::REFERER;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

pub const CRATE_NAME: &str = "shiftcal-fetch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 6,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Shape of the site's login form.
#[derive(Debug, Clone)]
pub struct LoginForm {
    pub path: String,
    pub username_field: String,
    pub password_field: String,
    pub csrf_field: String,
}

impl Default for LoginForm {
    fn default() -> Self {
        Self {
            path: "/services/login/".to_string(),
            username_field: "username".to_string(),
            password_field: "password".to_string(),
            csrf_field: "csrfmiddlewaretoken".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub status: StatusCode,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("login rejected at {url}")]
    LoginRejected { url: String },
    #[error("session closed")]
    SessionClosed,
}

/// Cookie-carrying session against the member site.
///
/// Dropping the session releases the connection pool and its cookies.
#[derive(Debug)]
pub struct MemberSession {
    client: reqwest::Client,
    base_url: Url,
    login_form: LoginForm,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl MemberSession {
    pub fn new(base_url: Url, config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url,
            login_form: LoginForm::default(),
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn with_login_form(mut self, login_form: LoginForm) -> Self {
        self.login_form = login_form;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn resolve(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|source| FetchError::InvalidUrl {
                url: path.to_string(),
                source,
            })
    }

    /// Signs in through the site's form login. Any CSRF token present on the
    /// login page is echoed back.
    pub async fn login(&self, credentials: &Credentials) -> Result<(), FetchError> {
        let login_url = self.resolve(&self.login_form.path)?;
        let login_page = self.fetch_page(login_url.as_str()).await?;
        let csrf = hidden_input_value(&login_page.body, &self.login_form.csrf_field);

        let mut form = vec![
            (self.login_form.username_field.as_str(), credentials.username.as_str()),
            (self.login_form.password_field.as_str(), credentials.password.as_str()),
        ];
        if let Some(token) = csrf.as_deref() {
            form.push((self.login_form.csrf_field.as_str(), token));
        }

        let resp = self
            .client
            .post(login_url.clone())
            .header(REFERER, login_url.as_str())
            .form(&form)
            .send()
            .instrument(info_span!("member_login", url = %login_url))
            .await?;

        let status = resp.status();
        let final_url = resp.url().clone();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url.to_string(),
            });
        }

        let body = resp.text().await?;
        if final_url.path() == login_url.path()
            && has_input_named(&body, &self.login_form.password_field)
        {
            return Err(FetchError::LoginRejected {
                url: final_url.to_string(),
            });
        }

        info!(user = %credentials.username, "logged in to member site");
        Ok(())
    }

    pub async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| FetchError::SessionClosed)?;
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        debug!(%status, bytes = body.len(), "fetched page");
                        return Ok(FetchedPage {
                            url: url.to_string(),
                            final_url,
                            status,
                            body,
                            fetched_at: Utc::now(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retrying page fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying page fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn input_selector(name: &str) -> Option<Selector> {
    Selector::parse(&format!("input[name=\"{name}\"]")).ok()
}

fn hidden_input_value(html: &str, name: &str) -> Option<String> {
    let selector = input_selector(name)?;
    let document = Html::parse_document(html);
    document
        .select(&selector)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn has_input_named(html: &str, name: &str) -> bool {
    let Some(selector) = input_selector(name) else {
        return false;
    };
    Html::parse_document(html).select(&selector).next().is_some()
}
