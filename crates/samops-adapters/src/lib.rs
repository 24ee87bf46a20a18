//! Shaping of raw SAM notice records into the fixed row schema.
//!
//! Upstream field names drift across notice types and API revisions, so every
//! target field is extracted through an ordered rule table of candidate key
//! paths, first present non-empty value wins. Adding tolerance for a renamed
//! field is a table edit, not new control flow.

use chrono::NaiveDate;
use samops_core::{coerce_date, OpportunityRow};
use serde_json::Value;

pub const CRATE_NAME: &str = "samops-adapters";

/// Candidate key paths per target field, in probe priority order.
type Rules = &'static [&'static [&'static str]];

const ID_RULES: Rules = &[&["noticeId"], &["id"], &["solicitationNumber"], &["uiLink"]];
const TITLE_RULES: Rules = &[&["title"]];
const SOLICITATION_RULES: Rules = &[&["solicitationNumber"]];
const POSTED_DATE_RULES: Rules = &[&["postedDate"], &["publishDate"]];
const RESPONSE_DATE_RULES: Rules = &[
    &["responseDate"],
    &["dueDate"],
    &["archiveDate"],
    &["closeDate"],
];
const SET_ASIDE_RULES: Rules = &[
    &["typeOfSetAsideDescription"],
    &["typeOfSetAside"],
    &["setAside"],
];
const NAICS_RULES: Rules = &[&["naicsCode"], &["naics"], &["classification", "naics"]];
const ORG_RULES: Rules = &[&["organizationName"], &["department"], &["office"]];
const CITY_RULES: Rules = &[
    &["placeOfPerformance", "city"],
    &["placeOfPerformance", "location", "city"],
    &["city"],
];
const STATE_RULES: Rules = &[
    &["placeOfPerformance", "state"],
    &["placeOfPerformance", "location", "state"],
    &["state"],
];
const ZIP_RULES: Rules = &[
    &["placeOfPerformance", "zip"],
    &["placeOfPerformance", "location", "zip"],
    &["zip"],
];
const URL_RULES: Rules = &[&["uiLink"], &["link"], &["url"]];
const DESCRIPTION_RULES: Rules = &[&["description"]];

/// Map one raw notice into the fixed row shape.
///
/// Total function: every field independently degrades to its default, so one
/// malformed record can never abort a batch. Text fields default to `""`,
/// dates to `None`.
pub fn shape_row(record: &Value) -> OpportunityRow {
    let mut row = OpportunityRow {
        id: first_text(record, ID_RULES),
        title: first_text(record, TITLE_RULES),
        solicitation_number: first_text(record, SOLICITATION_RULES),
        posted_date: first_date(record, POSTED_DATE_RULES),
        response_date: first_date(record, RESPONSE_DATE_RULES),
        set_aside: first_text(record, SET_ASIDE_RULES),
        naics: first_text(record, NAICS_RULES),
        org: first_text(record, ORG_RULES),
        city: first_text(record, CITY_RULES),
        state: first_text(record, STATE_RULES),
        zip: first_text(record, ZIP_RULES),
        url: first_text(record, URL_RULES),
        description: first_text(record, DESCRIPTION_RULES),
    };
    row.ensure_id();
    row
}

fn probe<'a>(record: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cursor = record;
    for key in path {
        cursor = cursor.as_object()?.get(*key)?;
    }
    Some(cursor)
}

/// Render a candidate value as text. Nulls and empty strings count as
/// absent so the probe moves on to the next rule; compound values are
/// scalarized to their compact JSON form rather than dropped.
fn scalarize(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        compound => Some(compound.to_string()),
    }
}

fn first_text(record: &Value, rules: Rules) -> String {
    rules
        .iter()
        .find_map(|path| probe(record, path).and_then(scalarize))
        .unwrap_or_default()
}

fn first_date(record: &Value, rules: Rules) -> Option<NaiveDate> {
    rules
        .iter()
        .find_map(|path| probe(record, path).and_then(scalarize))
        .and_then(|text| coerce_date(&text))
}
