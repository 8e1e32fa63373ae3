use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone};
use chrono_tz::America::New_York;
use shiftcal_core::ShiftKey;
use shiftcal_fetch::FetchError;
use shiftcal_scrape::{
    category_chains, scrape_chains, PageChain, PageParser, PageSource, ParseError, ParserConfig,
    ScrapeError,
};
use url::Url;

const BASE: &str = "https://members.example.org";

fn fixture(name: &str) -> String {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/calendar")
        .join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

#[derive(Default)]
struct FixtureSource {
    pages: HashMap<String, String>,
    fetched: Mutex<Vec<String>>,
}

impl FixtureSource {
    fn with_page(mut self, path: &str, fixture_name: &str) -> Self {
        self.pages.insert(format!("{BASE}{path}"), fixture(fixture_name));
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageSource for FixtureSource {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.pages.get(url).cloned().ok_or(FetchError::HttpStatus {
            status: 404,
            url: url.to_string(),
        })
    }
}

fn parser() -> PageParser {
    PageParser::new(ParserConfig::new(Url::parse(BASE).unwrap(), New_York)).unwrap()
}

fn key(month: u32, day: u32, hour: u32, minute: u32, label: &str) -> ShiftKey {
    ShiftKey::new(
        New_York
            .with_ymd_and_hms(2026, month, day, hour, minute, 0)
            .single()
            .unwrap(),
        label,
    )
}

fn claim(id: u32) -> String {
    format!("{BASE}/services/shift_claim/{id}/")
}

fn chains(categories: usize, weeks: usize) -> Vec<PageChain> {
    category_chains(
        &Url::parse(BASE).unwrap(),
        categories,
        weeks,
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
    )
    .unwrap()
}

#[test]
fn week_page_folds_duplicates_and_skips_claimed() {
    let page = parser()
        .parse_calendar_page(
            &fixture("week_0.html"),
            &Url::parse(&format!("{BASE}/services/shifts/0/0/0/2026-10-19/")).unwrap(),
        )
        .unwrap();

    let shifts = page.shifts;
    assert_eq!(shifts.len(), 3);
    assert_eq!(shifts.listing_count(), 4);
    let receiving = shifts.get(&key(10, 19, 6, 0, "🏋️ Receiving Lifting")).unwrap();
    assert_eq!(
        receiving.iter().cloned().collect::<Vec<_>>(),
        vec![claim(5001), claim(5002)]
    );
    assert!(shifts.contains_key(&key(10, 19, 10, 30, "Food Processing")));
    assert!(shifts.contains_key(&key(10, 20, 17, 45, "🛒 Checkout")));
    assert!(!shifts.iter().any(|(_, urls)| urls.contains(&claim(5003))));

    assert_eq!(
        page.next_page.unwrap().as_str(),
        "https://members.example.org/services/shifts/0/0/0/2026-10-26/"
    );
}

#[tokio::test]
async fn categories_merge_into_one_canonical_set() {
    let source = FixtureSource::default()
        .with_page("/services/shifts/0/0/0/2026-10-19/", "week_0.html")
        .with_page("/services/shifts/1/0/0/2026-10-19/", "week_1.html");

    let outcome = scrape_chains(&source, &parser(), &chains(2, 1)).await.unwrap();

    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.shifts.len(), 4);
    assert_eq!(
        outcome
            .shifts
            .get(&key(10, 19, 6, 0, "🏋️ Receiving Lifting"))
            .unwrap()
            .iter()
            .cloned()
            .collect::<Vec<_>>(),
        vec![claim(5001), claim(5002), claim(6001)]
    );
    assert!(outcome.shifts.contains_key(&key(10, 22, 19, 0, "📋 Office")));
}

#[tokio::test]
async fn pagination_follows_next_week_links_in_order() {
    let source = FixtureSource::default()
        .with_page("/services/shifts/0/0/0/2026-10-19/", "week_0.html")
        .with_page("/services/shifts/0/0/0/2026-10-26/", "week_0_next.html");

    let outcome = scrape_chains(&source, &parser(), &chains(1, 3)).await.unwrap();

    // The second page has no next link, so the chain stops after two pages.
    assert_eq!(outcome.pages, 2);
    assert_eq!(
        source.fetched(),
        vec![
            format!("{BASE}/services/shifts/0/0/0/2026-10-19/"),
            format!("{BASE}/services/shifts/0/0/0/2026-10-26/"),
        ]
    );
    assert!(outcome.shifts.contains_key(&key(10, 26, 6, 0, "🏋️ Receiving Lifting")));
    assert_eq!(outcome.shifts.len(), 4);
}

#[tokio::test]
async fn empty_week_is_not_an_error() {
    let source = FixtureSource::default()
        .with_page("/services/shifts/0/0/0/2026-10-19/", "empty_week.html");
    let outcome = scrape_chains(&source, &parser(), &chains(1, 1)).await.unwrap();
    assert_eq!(outcome.pages, 1);
    assert!(outcome.shifts.is_empty());
}

#[tokio::test]
async fn missing_href_aborts_the_scrape() {
    let source = FixtureSource::default()
        .with_page("/services/shifts/0/0/0/2026-10-19/", "week_0.html")
        .with_page("/services/shifts/1/0/0/2026-10-19/", "missing_href.html");

    let err = scrape_chains(&source, &parser(), &chains(2, 1)).await.unwrap_err();
    match err {
        ScrapeError::Parse { url, source } => {
            assert!(url.ends_with("/services/shifts/1/0/0/2026-10-19/"));
            assert!(matches!(source, ParseError::MissingHref { index: 1, .. }));
        }
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[tokio::test]
async fn fetch_failure_aborts_the_scrape() {
    let source = FixtureSource::default()
        .with_page("/services/shifts/0/0/0/2026-10-19/", "week_0.html");
    let err = scrape_chains(&source, &parser(), &chains(2, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        ScrapeError::Fetch {
            source: FetchError::HttpStatus { status: 404, .. },
            ..
        }
    ));
}
