//! Parser for the per-mission detail page

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};

use super::{
    ContextualParser, ParsingError, ParsingResult, compile_selector, is_plain_identifier,
    millis_to_seconds, normalized_text,
};
use crate::domain::incident::PageDetails;

#[derive(Debug, Clone)]
pub struct DetailParseContext {
    pub external_id: String,
    pub fetched_at: DateTime<Utc>,
}

pub struct MissionDetailParser {
    mission_marker_selector: Selector,
    any_countdown_selector: Selector,
    duration_selector: Selector,
    driving_selector: Selector,
    at_scene_selector: Selector,
    participant_selector: Selector,
}

impl MissionDetailParser {
    pub fn new() -> ParsingResult<Self> {
        Ok(Self {
            mission_marker_selector: compile_selector(
                "#missionH1, #mission_general_info, #mission_duration, [id^=\"mission_countdown\"], \
                 #mission_vehicle_driving, #mission_vehicle_at_mission",
            )?,
            any_countdown_selector: compile_selector("[id^=\"mission_countdown\"]")?,
            duration_selector: compile_selector("#mission_duration")?,
            driving_selector: compile_selector("#mission_vehicle_driving")?,
            at_scene_selector: compile_selector("#mission_vehicle_at_mission")?,
            participant_selector: compile_selector("a[href^=\"/profile/\"]")?,
        })
    }

    fn countdown_seconds(&self, html: &Html, external_id: &str) -> ParsingResult<Option<i64>> {
        let exact = if is_plain_identifier(external_id) {
            let selector = compile_selector(&format!("#mission_countdown_{external_id}"))?;
            html.select(&selector).next()
        } else {
            None
        };

        let Some(element) = exact.or_else(|| html.select(&self.any_countdown_selector).next()) else {
            return Ok(None);
        };

        Ok(element
            .value()
            .attr("timeleft")
            .and_then(millis_to_seconds)
            .or_else(|| parse_clock(&normalized_text(element))))
    }

    /// Owner names within one vehicle table, first occurrence order
    fn participants(&self, html: &Html, table: &Selector) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for link in html.select(table).flat_map(|t| t.select(&self.participant_selector)) {
            let name = normalized_text(link);
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    fn first_text(&self, html: &Html, selector: &Selector) -> Option<String> {
        html.select(selector)
            .next()
            .map(normalized_text)
            .filter(|text| !text.is_empty())
    }
}

impl ContextualParser for MissionDetailParser {
    type Output = PageDetails;
    type Context = DetailParseContext;

    fn parse_with_context(&self, html: &Html, context: &Self::Context) -> ParsingResult<PageDetails> {
        if html.select(&self.mission_marker_selector).next().is_none() {
            return Err(ParsingError::required_field_missing(
                "mission_page",
                Some(&context.external_id),
            ));
        }

        Ok(PageDetails {
            countdown_seconds: self.countdown_seconds(html, &context.external_id)?,
            duration: self.first_text(html, &self.duration_selector),
            driving: self.participants(html, &self.driving_selector),
            at_scene: self.participants(html, &self.at_scene_selector),
            fetched_at: Some(context.fetched_at),
        })
    }
}

/// `HH:MM:SS` or `MM:SS` to seconds
fn parse_clock(text: &str) -> Option<i64> {
    let parts = text
        .trim()
        .split(':')
        .map(|p| p.trim().parse::<i64>().ok())
        .collect::<Option<Vec<_>>>()?;

    match parts.as_slice() {
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        [m, s] => Some(m * 60 + s),
        _ => None,
    }
}
