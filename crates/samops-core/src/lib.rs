//! Core domain model for SAM opportunity rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "samops-core";

/// Well-known cursor key holding the incremental-sync high-water mark
/// (ISO `YYYY-MM-DD`).
pub const CURSOR_KEY: &str = "last_posted_from";

/// One persisted contracting-opportunity notice.
///
/// Text fields default to the empty string rather than an option; date
/// fields stay optional. Downstream filtering treats a missing
/// `response_date` as "no deadline", so the asymmetry is deliberate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityRow {
    pub id: String,
    pub title: String,
    pub solicitation_number: String,
    pub posted_date: Option<NaiveDate>,
    pub response_date: Option<NaiveDate>,
    pub set_aside: String,
    pub naics: String,
    pub org: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub url: String,
    pub description: String,
}

impl OpportunityRow {
    /// Deterministic identifier used when upstream supplies none.
    ///
    /// Derived from the solicitation number, posted date, and a truncated
    /// title so re-shaping the same notice always lands on the same key.
    pub fn fallback_id(&self) -> String {
        let posted = self
            .posted_date
            .map(|d| d.to_string())
            .unwrap_or_default();
        let title: String = self.title.chars().take(30).collect();
        format!("{}-{}-{}", self.solicitation_number, posted, title)
    }

    /// Guard against an empty primary key before the row reaches storage.
    pub fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = self.fallback_id();
        }
    }
}

/// Parse a calendar date from the first ten characters of an ISO-prefixed
/// string, e.g. `"2025-08-17T00:00:00"` or `"2025-08-17"`.
///
/// Anything else coerces to `None`; a malformed upstream value must never
/// abort a batch.
pub fn coerce_date(raw: &str) -> Option<NaiveDate> {
    let prefix: String = raw.chars().take(10).collect();
    NaiveDate::parse_from_str(&prefix, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_date_accepts_iso_prefix() {
        assert_eq!(
            coerce_date("2025-08-17T00:00:00"),
            NaiveDate::from_ymd_opt(2025, 8, 17)
        );
        assert_eq!(
            coerce_date("2025-08-17"),
            NaiveDate::from_ymd_opt(2025, 8, 17)
        );
    }

    #[test]
    fn coerce_date_rejects_garbage() {
        assert_eq!(coerce_date(""), None);
        assert_eq!(coerce_date("not a date"), None);
        assert_eq!(coerce_date("08/17/2025"), None);
        assert_eq!(coerce_date("2025-13-40"), None);
        assert_eq!(coerce_date("2025-8"), None);
    }

    #[test]
    fn fallback_id_is_deterministic() {
        let row = OpportunityRow {
            solicitation_number: "W912DW25R0001".into(),
            posted_date: NaiveDate::from_ymd_opt(2025, 8, 1),
            title: "Bridge deck rehabilitation".into(),
            ..Default::default()
        };
        assert_eq!(row.fallback_id(), row.fallback_id());
        assert_eq!(
            row.fallback_id(),
            "W912DW25R0001-2025-08-01-Bridge deck rehabilitation"
        );
    }

    #[test]
    fn fallback_id_truncates_title_on_char_boundaries() {
        let row = OpportunityRow {
            title: "é".repeat(40),
            ..Default::default()
        };
        let id = row.fallback_id();
        assert!(id.ends_with(&"é".repeat(30)));
    }

    #[test]
    fn ensure_id_only_fills_empty_ids() {
        let mut row = OpportunityRow {
            id: "SAM123".into(),
            ..Default::default()
        };
        row.ensure_id();
        assert_eq!(row.id, "SAM123");

        let mut row = OpportunityRow {
            solicitation_number: "ABC".into(),
            ..Default::default()
        };
        row.ensure_id();
        assert_eq!(row.id, "ABC--");
    }
}
