//! HTML parsing for the mission pages of the external source
//!
//! Parsers are plain synchronous functions over a `scraper::Html` document;
//! the document is built and dropped inside one call so it never crosses an
//! await point.

pub mod mission_detail_parser;
pub mod mission_list_parser;

pub use crate::infrastructure::parsing_error::{ParsingError, ParsingResult};
pub use mission_detail_parser::{DetailParseContext, MissionDetailParser};
pub use mission_list_parser::{
    ExtractionStats, ListParseContext, MISSION_LISTS, MissionListPage, MissionListParser,
    MissionListSource,
};

use scraper::{ElementRef, Html, Selector};

/// Parser that needs per-call context besides the document
pub trait ContextualParser {
    type Output;
    type Context;

    fn parse_with_context(&self, html: &Html, context: &Self::Context) -> ParsingResult<Self::Output>;

    /// Parse a raw document
    fn parse_document(&self, document: &str, context: &Self::Context) -> ParsingResult<Self::Output> {
        let html = Html::parse_document(document);
        self.parse_with_context(&html, context)
    }
}

pub(crate) fn compile_selector(selector: &str) -> ParsingResult<Selector> {
    Selector::parse(selector).map_err(|e| ParsingError::invalid_selector(selector, format!("{e:?}")))
}

/// Text content with whitespace collapsed
pub(crate) fn normalized_text(element: ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// Element ids are interpolated into selectors, so only plain identifiers are accepted
pub(crate) fn is_plain_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `timeleft` attributes are milliseconds
pub(crate) fn millis_to_seconds(value: &str) -> Option<i64> {
    let millis = value.trim().parse::<f64>().ok()?;
    (millis.is_finite() && millis >= 0.0).then(|| (millis / 1000.0).round() as i64)
}
