//! Parser for the mission sidebar lists of the main page
//!
//! Each configured list container holds `div.missionSideBarEntry` elements.
//! An entry yields one [`ExtractedIncident`] whose list context is read from
//! the id-suffixed child elements of the entry.

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use super::{
    ContextualParser, ParsingError, ParsingResult, compile_selector, is_plain_identifier,
    millis_to_seconds, normalized_text,
};
use crate::domain::incident::{
    Coordinates, ExtractedIncident, IncidentCategory, IncidentSource, IncidentStatus, ListContext,
};

/// One configured list: container id, source tag, category tag, shared filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissionListSource {
    pub container_id: &'static str,
    pub source: IncidentSource,
    pub category: IncidentCategory,
    /// Entries not flagged as shared are skipped
    pub requires_shared: bool,
}

pub const MISSION_LISTS: [MissionListSource; 6] = [
    MissionListSource {
        container_id: "mission_list",
        source: IncidentSource::Own,
        category: IncidentCategory::Emergency,
        requires_shared: false,
    },
    MissionListSource {
        container_id: "mission_list_shared",
        source: IncidentSource::OwnShared,
        category: IncidentCategory::Emergency,
        requires_shared: true,
    },
    MissionListSource {
        container_id: "mission_list_alliance",
        source: IncidentSource::Alliance,
        category: IncidentCategory::Emergency,
        requires_shared: false,
    },
    MissionListSource {
        container_id: "mission_list_alliance_event",
        source: IncidentSource::AllianceEvent,
        category: IncidentCategory::Event,
        requires_shared: false,
    },
    MissionListSource {
        container_id: "mission_list_sicherheitswache",
        source: IncidentSource::Own,
        category: IncidentCategory::Planned,
        requires_shared: false,
    },
    MissionListSource {
        container_id: "mission_list_sicherheitswache_alliance",
        source: IncidentSource::Alliance,
        category: IncidentCategory::Planned,
        requires_shared: true,
    },
];

/// Counters of one extraction pass
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ExtractionStats {
    pub total: usize,
    pub by_source: BTreeMap<IncidentSource, usize>,
    pub by_category: BTreeMap<IncidentCategory, usize>,
    /// Entries filtered out by a list's shared requirement
    pub skipped: usize,
    /// Ids already taken from an earlier list
    pub duplicates: usize,
    /// Entries that could not be read
    pub malformed: usize,
    pub containers_found: usize,
    pub elapsed_ms: u64,
}

impl ExtractionStats {
    fn count(&mut self, record: &ExtractedIncident) {
        self.total += 1;
        *self.by_source.entry(record.source).or_default() += 1;
        *self.by_category.entry(record.category).or_default() += 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissionListPage {
    pub records: Vec<ExtractedIncident>,
    pub stats: ExtractionStats,
}

#[derive(Debug, Clone)]
pub struct ListParseContext {
    pub extracted_at: DateTime<Utc>,
}

pub struct MissionListParser {
    containers: Vec<(MissionListSource, Selector)>,
    entry_selector: Selector,
    shared_marker_selector: Selector,
    panel_selector: Selector,
    patient_selector: Selector,
    bracketed_fragment: Regex,
    first_number: Regex,
    width_percent: Regex,
}

impl MissionListParser {
    pub fn new() -> ParsingResult<Self> {
        Self::with_lists(&MISSION_LISTS)
    }

    pub fn with_lists(lists: &[MissionListSource]) -> ParsingResult<Self> {
        let containers = lists
            .iter()
            .map(|list| Ok((*list, compile_selector(&format!("#{}", list.container_id))?)))
            .collect::<ParsingResult<Vec<_>>>()?;

        Ok(Self {
            containers,
            entry_selector: compile_selector("div.missionSideBarEntry")?,
            shared_marker_selector: compile_selector(".mission_shared")?,
            panel_selector: compile_selector("[class*=\"mission_panel_\"]")?,
            patient_selector: compile_selector(".patient_progress, .mission_patient")?,
            bracketed_fragment: compile_regex(r"\[[^\]]*\]")?,
            first_number: compile_regex(r"\d+")?,
            width_percent: compile_regex(r"width\s*:\s*([0-9]+(?:\.[0-9]+)?)\s*%")?,
        })
    }

    fn parse_entry(
        &self,
        entry: ElementRef<'_>,
        list: &MissionListSource,
        context: &ListParseContext,
    ) -> ParsingResult<ExtractedIncident> {
        let attrs = entry.value();
        let external_id = attrs
            .attr("mission_id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ParsingError::required_field_missing("mission_id", Some(list.container_id)))?;
        if !is_plain_identifier(external_id) {
            return Err(ParsingError::invalid_value("mission_id", external_id));
        }

        let address = self
            .child_text(entry, "mission_address_", external_id)?
            .filter(|a| !a.is_empty());
        let caption = self
            .child_text(entry, "mission_caption_", external_id)?
            .ok_or_else(|| ParsingError::required_field_missing("caption", Some(external_id)))?;
        let title = self.clean_title(&caption, address.as_deref());
        if title.is_empty() {
            return Err(ParsingError::invalid_value("caption", &caption));
        }

        let panel_color = self.panel_color(entry);
        let status = panel_color
            .as_deref()
            .and_then(IncidentStatus::from_panel_color)
            .unwrap_or_else(|| {
                debug!("Mission {} has no panel colour, assuming unclaimed", external_id);
                IncidentStatus::Unclaimed
            });

        let coordinates = match (
            attrs.attr("latitude").and_then(|v| v.trim().parse::<f64>().ok()),
            attrs.attr("longitude").and_then(|v| v.trim().parse::<f64>().ok()),
        ) {
            (Some(latitude), Some(longitude)) => Some(Coordinates { latitude, longitude }),
            _ => None,
        };

        let type_code = attrs
            .attr("mission_type_id")
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != "null")
            .map(ToString::to_string);

        let list_context = ListContext {
            panel_color,
            shared: self.is_shared(entry),
            missing_resources: self
                .child_text(entry, "mission_missing_short_", external_id)?
                .filter(|t| !t.is_empty()),
            patient_count: self.patient_count(entry, external_id)?,
            countdown_seconds: self
                .child(entry, "mission_overview_countdown_", external_id)?
                .and_then(|el| el.value().attr("timeleft"))
                .and_then(millis_to_seconds),
            progress_percent: self
                .child(entry, "mission_bar_", external_id)?
                .and_then(|el| el.value().attr("style"))
                .and_then(|style| self.width_percent.captures(style))
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok()),
            extracted_at: Some(context.extracted_at),
        };

        Ok(ExtractedIncident {
            external_id: external_id.to_string(),
            title,
            type_code,
            status,
            source: list.source,
            category: list.category,
            coordinates,
            address,
            list_context,
        })
    }

    fn child<'a>(
        &self,
        entry: ElementRef<'a>,
        prefix: &str,
        external_id: &str,
    ) -> ParsingResult<Option<ElementRef<'a>>> {
        let selector = compile_selector(&format!("#{prefix}{external_id}"))?;
        Ok(entry.select(&selector).next())
    }

    fn child_text(
        &self,
        entry: ElementRef<'_>,
        prefix: &str,
        external_id: &str,
    ) -> ParsingResult<Option<String>> {
        Ok(self.child(entry, prefix, external_id)?.map(normalized_text))
    }

    fn is_shared(&self, entry: ElementRef<'_>) -> bool {
        entry.value().attr("data-shared") == Some("true")
            || entry.value().classes().any(|c| c == "mission_shared")
            || entry.select(&self.shared_marker_selector).next().is_some()
    }

    fn panel_color(&self, entry: ElementRef<'_>) -> Option<String> {
        std::iter::once(entry)
            .chain(entry.select(&self.panel_selector))
            .flat_map(|el| el.value().classes())
            .filter_map(|class| class.strip_prefix("mission_panel_"))
            .find(|color| IncidentStatus::from_panel_color(color).is_some())
            .map(ToString::to_string)
    }

    fn patient_count(&self, entry: ElementRef<'_>, external_id: &str) -> ParsingResult<Option<u32>> {
        let Some(patients) = self.child(entry, "mission_patients_", external_id)? else {
            return Ok(None);
        };

        let listed = patients.select(&self.patient_selector).count();
        if listed > 0 {
            return Ok(u32::try_from(listed).ok());
        }

        Ok(self
            .first_number
            .find(&normalized_text(patients))
            .and_then(|m| m.as_str().parse().ok()))
    }

    /// Remove the address, bracketed caption fragments and a trailing separator
    fn clean_title(&self, caption: &str, address: Option<&str>) -> String {
        let mut title = caption.to_string();
        if let Some(address) = address {
            title = title.replace(address, "");
        }
        let title = self.bracketed_fragment.replace_all(&title, " ");
        let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
        title
            .trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '-' | '|' | ':'))
            .to_string()
    }
}

impl ContextualParser for MissionListParser {
    type Output = MissionListPage;
    type Context = ListParseContext;

    fn parse_with_context(&self, html: &Html, context: &Self::Context) -> ParsingResult<MissionListPage> {
        let mut stats = ExtractionStats::default();
        let mut records = Vec::new();
        let mut seen = HashSet::new();

        for (list, selector) in &self.containers {
            let Some(container) = html.select(selector).next() else {
                debug!("List container #{} not present", list.container_id);
                continue;
            };
            stats.containers_found += 1;

            for entry in container.select(&self.entry_selector) {
                let record = match self.parse_entry(entry, list, context) {
                    Ok(record) => record,
                    Err(e) if e.is_entry_level() => {
                        warn!("Skipping unreadable entry in #{}: {}", list.container_id, e);
                        stats.malformed += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                if list.requires_shared && !record.list_context.shared {
                    stats.skipped += 1;
                    continue;
                }
                if !seen.insert(record.external_id.clone()) {
                    debug!("Mission {} already listed, ignoring copy in #{}", record.external_id, list.container_id);
                    stats.duplicates += 1;
                    continue;
                }

                stats.count(&record);
                records.push(record);
            }
        }

        if stats.containers_found == 0 {
            return Err(ParsingError::NoListContainers {
                tried_containers: self
                    .containers
                    .iter()
                    .map(|(list, _)| list.container_id.to_string())
                    .collect(),
            });
        }

        Ok(MissionListPage { records, stats })
    }
}

fn compile_regex(pattern: &str) -> ParsingResult<Regex> {
    Regex::new(pattern).map_err(|e| ParsingError::invalid_value("pattern", &format!("{pattern}: {e}")))
}
