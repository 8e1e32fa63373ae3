//! Event description format.
//!
//! ```text
//! 2 shift(s) available for 🛒 Checkout:
//! <ul>
//! <li>https://members.example.org/services/shift_claim/1/</li>
//! <li>https://members.example.org/services/shift_claim/2/</li>
//! </ul>
//! shiftcal-format: v1
//! ```
//!
//! Descriptions written before the format line existed decode as version 0.

use std::collections::BTreeSet;

use thiserror::Error;

pub const FORMAT_VERSION: u32 = 1;

const VERSION_PREFIX: &str = "shiftcal-format: v";
const COUNT_INFIX: &str = " shift(s) available for ";
const LIST_OPEN: &str = "<ul>";
const LIST_CLOSE: &str = "</ul>";
const ITEM_OPEN: &str = "<li>";
const ITEM_CLOSE: &str = "</li>";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("description is empty")]
    Empty,
    #[error("event has no title")]
    MissingTitle,
    #[error("line 1: expected `N shift(s) available for LABEL:`, found `{0}`")]
    CountLine(String),
    #[error("line {line}: unexpected `{text}`")]
    UnexpectedLine { line: usize, text: String },
    #[error("unsupported description format `{0}`")]
    UnsupportedVersion(String),
    #[error("url list is not closed")]
    Unterminated,
    #[error("description lists no urls")]
    NoUrls,
    #[error("count line declares {declared} shift(s) but {listed} distinct urls are listed")]
    CountMismatch { declared: usize, listed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDescription {
    pub version: u32,
    pub label: String,
    pub urls: BTreeSet<String>,
}

/// Renders the description for `label` and its urls. Whitespace runs in the
/// label, line breaks included, become single spaces on the count line.
pub fn encode(label: &str, urls: &BTreeSet<String>) -> String {
    let label = label.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut lines = Vec::with_capacity(urls.len() + 4);
    lines.push(format!("{}{COUNT_INFIX}{label}:", urls.len()));
    lines.push(LIST_OPEN.to_string());
    lines.extend(urls.iter().map(|url| format!("{ITEM_OPEN}{url}{ITEM_CLOSE}")));
    lines.push(LIST_CLOSE.to_string());
    lines.push(format!("{VERSION_PREFIX}{FORMAT_VERSION}"));
    lines.join("\n")
}

fn parse_count_line(line: &str) -> Result<(usize, String), CodecError> {
    let bad = || CodecError::CountLine(line.to_string());
    let (count, rest) = line.split_once(COUNT_INFIX).ok_or_else(bad)?;
    let count = count.trim().parse::<usize>().map_err(|_| bad())?;
    let label = rest.strip_suffix(':').ok_or_else(bad)?;
    Ok((count, label.to_string()))
}

pub fn decode(description: &str) -> Result<DecodedDescription, CodecError> {
    let mut lines = description
        .trim()
        .lines()
        .map(str::trim)
        .enumerate()
        .map(|(i, text)| (i + 1, text));

    let (_, first) = lines
        .next()
        .filter(|(_, t)| !t.is_empty())
        .ok_or(CodecError::Empty)?;
    let (declared, label) = parse_count_line(first)?;

    match lines.next() {
        Some((_, LIST_OPEN)) => {}
        Some((line, text)) => {
            return Err(CodecError::UnexpectedLine {
                line,
                text: text.to_string(),
            })
        }
        None => return Err(CodecError::Unterminated),
    }

    let mut listed = 0usize;
    let mut urls = BTreeSet::new();
    loop {
        match lines.next() {
            Some((_, LIST_CLOSE)) => break,
            Some((line, text)) => {
                let url = text
                    .strip_prefix(ITEM_OPEN)
                    .and_then(|t| t.strip_suffix(ITEM_CLOSE))
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| CodecError::UnexpectedLine {
                        line,
                        text: text.to_string(),
                    })?;
                listed += 1;
                urls.insert(url.to_string());
            }
            None => return Err(CodecError::Unterminated),
        }
    }

    let version = match lines.next() {
        None => 0,
        Some((line, text)) => {
            let version = text
                .strip_prefix(VERSION_PREFIX)
                .ok_or_else(|| CodecError::UnexpectedLine {
                    line,
                    text: text.to_string(),
                })?;
            match version.parse::<u32>() {
                Ok(FORMAT_VERSION) => FORMAT_VERSION,
                _ => return Err(CodecError::UnsupportedVersion(text.to_string())),
            }
        }
    };
    if let Some((line, text)) = lines.next() {
        return Err(CodecError::UnexpectedLine {
            line,
            text: text.to_string(),
        });
    }

    if urls.is_empty() {
        return Err(CodecError::NoUrls);
    }
    if declared != listed || listed != urls.len() {
        return Err(CodecError::CountMismatch {
            declared,
            listed: urls.len(),
        });
    }

    Ok(DecodedDescription {
        version,
        label,
        urls,
    })
}
