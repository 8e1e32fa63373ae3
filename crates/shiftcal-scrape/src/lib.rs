//! Shift calendar page parsing and multi-page aggregation.

use async_trait::async_trait;
use chrono::{LocalResult, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use futures::stream::{FuturesUnordered, StreamExt};
use scraper::{ElementRef, Html, Selector};
use shiftcal_core::{ShiftKey, ShiftSet};
use shiftcal_fetch::{FetchError, MemberSession};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "shiftcal-scrape";

const START_TIME_FORMAT: &str = "%m/%d/%Y %I:%M%p";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("day cell {cell} has no date heading")]
    MissingDateHeading { cell: usize },
    #[error("unrecognised date heading `{text}`")]
    MalformedDate { text: String },
    #[error("listing {index} on {date} has no href")]
    MissingHref { date: String, index: usize },
    #[error("listing {index} on {date} has no start time")]
    MissingStartTime { date: String, index: usize },
    #[error("listing {index} on {date} has a malformed label `{text}`")]
    MalformedLabel {
        date: String,
        index: usize,
        text: String,
    },
    #[error("cannot parse `{text}` as a shift start: {source}")]
    InvalidTime {
        text: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("`{text}` does not exist in {timezone}")]
    NonexistentLocalTime { text: String, timezone: Tz },
    #[error("cannot resolve href `{href}`: {source}")]
    InvalidHref {
        href: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("parsing {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },
}

/// Markup hooks for the shift calendar grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarSelectors {
    pub day_cell: String,
    pub date_heading: String,
    pub listing: String,
    pub start_time: String,
    /// Class marking a listing the viewer has already claimed.
    pub claimed_class: String,
    /// Leading text of the link to the following week.
    pub next_page_text: String,
}

impl Default for CalendarSelectors {
    fn default() -> Self {
        Self {
            day_cell: ".grid-container div.col".to_string(),
            date_heading: "p b".to_string(),
            listing: "a.shift".to_string(),
            start_time: "b".to_string(),
            claimed_class: "my_shift".to_string(),
            next_page_text: "Next Week".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub base_url: Url,
    pub timezone: Tz,
    pub selectors: CalendarSelectors,
    /// Glyphs stripped from the front of listing text before it is split.
    pub decorative_prefixes: Vec<String>,
}

impl ParserConfig {
    pub fn new(base_url: Url, timezone: Tz) -> Self {
        Self {
            base_url,
            timezone,
            selectors: CalendarSelectors::default(),
            decorative_prefixes: vec!["🥕".to_string()],
        }
    }
}

/// Shifts found on one page and the location of the following week, if linked.
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub shifts: ShiftSet,
    pub next_page: Option<Url>,
}

#[derive(Debug)]
pub struct PageParser {
    config: ParserConfig,
    day_cell: Selector,
    date_heading: Selector,
    listing: Selector,
    start_time: Selector,
    anchor: Selector,
}

fn compile(selector: &str) -> Result<Selector, ParseError> {
    Selector::parse(selector).map_err(|e| ParseError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn normalized_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_glyph(token: &str) -> bool {
    !token.is_empty() && !token.chars().any(char::is_alphanumeric)
}

/// Turns listing text into the display label.
///
/// Decorative prefixes are stripped, the leading time-of-day token dropped,
/// and a trailing category glyph moved to the front so `Checkout 🛒` reads
/// `🛒 Checkout`. Returns `None` when no label text remains.
pub fn display_label(text: &str, decorative_prefixes: &[String]) -> Option<String> {
    let mut rest = text.trim();
    loop {
        let before = rest;
        for prefix in decorative_prefixes.iter().filter(|p| !p.is_empty()) {
            rest = rest.trim_start_matches(prefix.as_str()).trim_start();
        }
        if rest == before {
            break;
        }
    }

    let (_time, label) = rest.split_once(char::is_whitespace)?;
    let tokens = label.split_whitespace().collect::<Vec<_>>();
    match tokens.split_last() {
        None => None,
        Some((glyph, phrase)) if is_glyph(glyph) && !phrase.is_empty() => {
            if phrase.iter().all(|t| is_glyph(t)) {
                return None;
            }
            Some(format!("{glyph} {}", phrase.join(" ")))
        }
        Some(_) if tokens.iter().all(|t| is_glyph(t)) => None,
        Some(_) => Some(tokens.join(" ")),
    }
}

/// Pulls the `m/d/Y` date out of a `<weekday> <m/d/Y>` heading.
pub fn heading_date(text: &str) -> Result<&str, ParseError> {
    let tokens = text.split_whitespace().collect::<Vec<_>>();
    match tokens.as_slice() {
        [_weekday, date] if NaiveDate::parse_from_str(date, "%m/%d/%Y").is_ok() => Ok(*date),
        _ => Err(ParseError::MalformedDate {
            text: text.to_string(),
        }),
    }
}

/// Combines a heading date and a listing time of day into an instant in `timezone`.
pub fn shift_start(
    date: &str,
    time_of_day: &str,
    timezone: Tz,
) -> Result<chrono::DateTime<Tz>, ParseError> {
    let text = format!("{date} {}", time_of_day.trim().to_ascii_uppercase());
    let naive = NaiveDateTime::parse_from_str(&text, START_TIME_FORMAT)
        .map_err(|source| ParseError::InvalidTime {
            text: text.clone(),
            source,
        })?;
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(start) => Ok(start),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest),
        LocalResult::None => Err(ParseError::NonexistentLocalTime { text, timezone }),
    }
}

impl PageParser {
    pub fn new(config: ParserConfig) -> Result<Self, ParseError> {
        Ok(Self {
            day_cell: compile(&config.selectors.day_cell)?,
            date_heading: compile(&config.selectors.date_heading)?,
            listing: compile(&config.selectors.listing)?,
            start_time: compile(&config.selectors.start_time)?,
            anchor: compile("a[href]")?,
            config,
        })
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// Every unclaimed shift on one rendered calendar page.
    pub fn parse_page(&self, html: &str) -> Result<ShiftSet, ParseError> {
        let document = Html::parse_document(html);
        self.parse_days(&document)
    }

    /// Like [`PageParser::parse_page`], also locating the "next week" link
    /// relative to `page_url`.
    pub fn parse_calendar_page(
        &self,
        html: &str,
        page_url: &Url,
    ) -> Result<ParsedPage, ParseError> {
        let document = Html::parse_document(html);
        let shifts = self.parse_days(&document)?;
        let next_page = self.next_page_link(&document, page_url)?;
        Ok(ParsedPage { shifts, next_page })
    }

    fn parse_days(&self, document: &Html) -> Result<ShiftSet, ParseError> {
        // Cells are distinct dates, so keys never collide between them; the
        // merge is the same fold regardless.
        document
            .select(&self.day_cell)
            .enumerate()
            .try_fold(ShiftSet::new(), |acc, (cell_index, cell)| {
                Ok(acc.merge(self.parse_day(cell, cell_index)?))
            })
    }

    fn parse_day(&self, cell: ElementRef<'_>, cell_index: usize) -> Result<ShiftSet, ParseError> {
        let heading = cell
            .select(&self.date_heading)
            .next()
            .ok_or(ParseError::MissingDateHeading { cell: cell_index })?;
        let heading_text = normalized_text(heading);
        let date = heading_date(&heading_text)?;

        let mut shifts = ShiftSet::new();
        for (index, listing) in cell.select(&self.listing).enumerate() {
            if listing
                .value()
                .classes()
                .any(|class| class == self.config.selectors.claimed_class)
            {
                debug!(date, index, "skipping claimed listing");
                continue;
            }

            let href = listing
                .value()
                .attr("href")
                .map(str::trim)
                .filter(|href| !href.is_empty())
                .ok_or_else(|| ParseError::MissingHref {
                    date: date.to_string(),
                    index,
                })?;
            let url = self
                .config
                .base_url
                .join(href)
                .map_err(|source| ParseError::InvalidHref {
                    href: href.to_string(),
                    source,
                })?;

            let time_of_day = listing
                .select(&self.start_time)
                .next()
                .map(normalized_text)
                .filter(|text| !text.is_empty())
                .ok_or_else(|| ParseError::MissingStartTime {
                    date: date.to_string(),
                    index,
                })?;

            let text = normalized_text(listing);
            let label = display_label(&text, &self.config.decorative_prefixes).ok_or_else(|| {
                ParseError::MalformedLabel {
                    date: date.to_string(),
                    index,
                    text: text.clone(),
                }
            })?;

            let start_time = shift_start(date, &time_of_day, self.config.timezone)?;
            shifts.insert_listing(ShiftKey::new(start_time, label), url.to_string());
        }
        Ok(shifts)
    }

    fn next_page_link(&self, document: &Html, page_url: &Url) -> Result<Option<Url>, ParseError> {
        let prefix = self.config.selectors.next_page_text.as_str();
        let Some(href) = document
            .select(&self.anchor)
            .find(|a| normalized_text(*a).starts_with(prefix))
            .and_then(|a| a.value().attr("href"))
        else {
            return Ok(None);
        };
        page_url
            .join(href.trim())
            .map(Some)
            .map_err(|source| ParseError::InvalidHref {
                href: href.to_string(),
                source,
            })
    }
}

/// Where calendar pages come from.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for MemberSession {
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        self.fetch_page(url).await.map(|page| page.body)
    }
}

/// A starting page plus how many "next week" links to follow from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageChain {
    pub start_url: Url,
    pub follow_next: usize,
}

/// One chain per listing category, each starting at the week of `date`.
pub fn category_chains(
    base_url: &Url,
    categories: usize,
    weeks_per_category: usize,
    date: NaiveDate,
) -> Result<Vec<PageChain>, ParseError> {
    (0..categories)
        .map(|category| {
            let path = format!("/services/shifts/{category}/0/0/{}/", date.format("%Y-%m-%d"));
            let start_url = base_url
                .join(&path)
                .map_err(|source| ParseError::InvalidHref { href: path, source })?;
            Ok(PageChain {
                start_url,
                follow_next: weeks_per_category.saturating_sub(1),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeOutcome {
    pub shifts: ShiftSet,
    pub pages: usize,
}

impl ScrapeOutcome {
    pub fn merge(self, other: ScrapeOutcome) -> ScrapeOutcome {
        ScrapeOutcome {
            shifts: self.shifts.merge(other.shifts),
            pages: self.pages + other.pages,
        }
    }
}

/// Walks one chain page by page; each page's next link is only known once
/// the previous page is parsed.
pub async fn scrape_chain<S>(
    source: &S,
    parser: &PageParser,
    chain: &PageChain,
) -> Result<ScrapeOutcome, ScrapeError>
where
    S: PageSource + ?Sized,
{
    let mut outcome = ScrapeOutcome::default();
    let mut remaining = chain.follow_next;
    let mut next = Some(chain.start_url.clone());

    while let Some(url) = next.take() {
        let html = source
            .fetch_html(url.as_str())
            .await
            .map_err(|source| ScrapeError::Fetch {
                url: url.to_string(),
                source,
            })?;
        let page = parser
            .parse_calendar_page(&html, &url)
            .map_err(|source| ScrapeError::Parse {
                url: url.to_string(),
                source,
            })?;
        debug!(%url, shifts = page.shifts.len(), "parsed calendar page");

        outcome = outcome.merge(ScrapeOutcome {
            shifts: page.shifts,
            pages: 1,
        });

        if remaining == 0 {
            break;
        }
        remaining -= 1;
        next = page.next_page;
        if next.is_none() {
            warn!(%url, remaining, "calendar page has no next-week link; chain ends early");
        }
    }

    Ok(outcome)
}

/// Scrapes every chain concurrently and unions the results as they finish.
/// The first failing page aborts the whole scrape.
pub async fn scrape_chains<S>(
    source: &S,
    parser: &PageParser,
    chains: &[PageChain],
) -> Result<ScrapeOutcome, ScrapeError>
where
    S: PageSource + ?Sized,
{
    let mut pending = chains
        .iter()
        .map(|chain| scrape_chain(source, parser, chain))
        .collect::<FuturesUnordered<_>>();

    let mut outcome = ScrapeOutcome::default();
    while let Some(result) = pending.next().await {
        outcome = outcome.merge(result?);
    }

    info!(
        pages = outcome.pages,
        shifts = outcome.shifts.len(),
        listings = outcome.shifts.listing_count(),
        "scrape complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn parser() -> PageParser {
        PageParser::new(ParserConfig::new(
            Url::parse("https://members.example.org").unwrap(),
            New_York,
        ))
        .unwrap()
    }

    fn page(cells: &str) -> String {
        format!(r#"<html><body><div class="grid-container">{cells}</div></body></html>"#)
    }

    #[test]
    fn trailing_glyph_moves_to_front() {
        let none: Vec<String> = Vec::new();
        assert_eq!(display_label("6:00am Checkout 🛒", &none).as_deref(), Some("🛒 Checkout"));
        assert_eq!(
            display_label("6:00am Receiving Lifting 🏋️", &none).as_deref(),
            Some("🏋️ Receiving Lifting")
        );
        assert_eq!(
            display_label("6:00am Food Processing", &none).as_deref(),
            Some("Food Processing")
        );
    }

    #[test]
    fn decorative_prefix_is_stripped_before_splitting() {
        let prefixes = vec!["🥕".to_string()];
        assert_eq!(
            display_label("🥕🥕 10:30am Office 📋", &prefixes).as_deref(),
            Some("📋 Office")
        );
        assert_eq!(display_label("🥕10:30am", &prefixes), None);
        assert_eq!(display_label("10:30am 🛒", &prefixes), None);
    }

    #[test]
    fn heading_requires_weekday_and_date() {
        assert_eq!(heading_date("Monday 10/19/2026").unwrap(), "10/19/2026");
        assert!(matches!(
            heading_date("10/19/2026"),
            Err(ParseError::MalformedDate { .. })
        ));
        assert!(matches!(
            heading_date("Monday October 19"),
            Err(ParseError::MalformedDate { .. })
        ));
    }

    #[test]
    fn start_combines_date_time_and_zone() {
        let start = shift_start("10/19/2026", "5:45pm", New_York).unwrap();
        assert_eq!(start.to_rfc3339(), "2026-10-19T17:45:00-04:00");
        let winter = shift_start("12/01/2026", "6:00AM", New_York).unwrap();
        assert_eq!(winter.to_rfc3339(), "2026-12-01T06:00:00-05:00");
    }

    #[test]
    fn spring_forward_gap_is_rejected() {
        assert!(matches!(
            shift_start("03/08/2026", "2:30am", New_York),
            Err(ParseError::NonexistentLocalTime { .. })
        ));
    }

    #[test]
    fn fall_back_overlap_takes_the_earlier_instant() {
        let start = shift_start("11/01/2026", "1:30am", New_York).unwrap();
        assert_eq!(start.to_rfc3339(), "2026-11-01T01:30:00-04:00");
        let after = shift_start("11/01/2026", "2:30am", New_York).unwrap();
        assert_eq!(after - start, chrono::TimeDelta::minutes(120));
    }

    #[test]
    fn duplicate_listings_in_a_cell_become_one_shift() {
        let html = page(
            r#"<div class="col"><p><b>Monday 10/19/2026</b></p>
               <a class="shift" href="/services/shift_claim/1/"><b>6:00am</b> Checkout 🛒</a>
               <a class="shift" href="/services/shift_claim/2/"><b>6:00am</b> Checkout 🛒</a>
               </div>"#,
        );
        let shifts = parser().parse_page(&html).unwrap();
        assert_eq!(shifts.len(), 1);
        let (key, urls) = shifts.iter().next().unwrap();
        assert_eq!(key.label, "🛒 Checkout");
        assert_eq!(
            urls.iter().cloned().collect::<Vec<_>>(),
            vec![
                "https://members.example.org/services/shift_claim/1/",
                "https://members.example.org/services/shift_claim/2/",
            ]
        );
    }

    #[test]
    fn claimed_listings_are_not_available() {
        let html = page(
            r#"<div class="col"><p><b>Monday 10/19/2026</b></p>
               <a class="shift my_shift" href="/services/shift_claim/1/"><b>6:00am</b> Checkout 🛒</a>
               </div>"#,
        );
        assert!(parser().parse_page(&html).unwrap().is_empty());
    }

    #[test]
    fn listing_without_href_fails_the_page() {
        let html = page(
            r#"<div class="col"><p><b>Monday 10/19/2026</b></p>
               <a class="shift"><b>6:00am</b> Checkout 🛒</a></div>"#,
        );
        assert!(matches!(
            parser().parse_page(&html),
            Err(ParseError::MissingHref { index: 0, .. })
        ));
    }

    #[test]
    fn cell_without_heading_fails_the_page() {
        let html = page(
            r#"<div class="col"><a class="shift" href="/x/"><b>6:00am</b> Checkout</a></div>"#,
        );
        assert!(matches!(
            parser().parse_page(&html),
            Err(ParseError::MissingDateHeading { cell: 0 })
        ));
    }

    #[test]
    fn listing_without_label_fails_the_page() {
        let html = page(
            r#"<div class="col"><p><b>Monday 10/19/2026</b></p>
               <a class="shift" href="/x/"><b>6:00am</b></a></div>"#,
        );
        assert!(matches!(
            parser().parse_page(&html),
            Err(ParseError::MalformedLabel { .. })
        ));
    }

    #[test]
    fn page_without_cells_is_empty() {
        assert!(parser().parse_page("<html><body></body></html>").unwrap().is_empty());
    }

    #[test]
    fn category_chains_cover_every_category() {
        let base = Url::parse("https://members.example.org").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let chains = category_chains(&base, 3, 2, date).unwrap();
        assert_eq!(chains.len(), 3);
        assert_eq!(
            chains[2].start_url.as_str(),
            "https://members.example.org/services/shifts/2/0/0/2026-10-19/"
        );
        assert!(chains.iter().all(|c| c.follow_next == 1));
    }
}
