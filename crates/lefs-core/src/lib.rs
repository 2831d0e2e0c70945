//! Core domain model for LEFS: registry filings, persisted contract rows and sync windows.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lefs-core";

/// Label of the "contract execution" filing type. Filings of this type are never stored.
pub const ORIGINATION_TYPE_LABEL: &str = "Заключение договора финансовой аренды (лизинга)";

/// Registry type codes and their localized labels.
pub const CONTRACT_TYPE_LABELS: &[(&str, &str)] = &[
    ("FinancialLeaseContract", ORIGINATION_TYPE_LABEL),
    (
        "ChangeFinancialLeaseContract",
        "Изменение договора финансовой аренды (лизинга)",
    ),
    (
        "StopFinancialLeaseContract",
        "Прекращение договора финансовой аренды (лизинга)",
    ),
];

/// Map a registry type code to its label. Unknown values pass through unchanged.
pub fn translate_contract_type(code: &str) -> String {
    CONTRACT_TYPE_LABELS
        .iter()
        .find(|(known, _)| *known == code)
        .map(|(_, label)| (*label).to_string())
        .unwrap_or_else(|| code.to_string())
}

pub fn is_origination(type_label: &str) -> bool {
    type_label == ORIGINATION_TYPE_LABEL
}

/// The registry sends `null` for absent strings and lists; read those as empty.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DocumentWithHit {
    #[serde(default, deserialize_with = "null_as_default")]
    pub guid: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
}

/// One item of the listing endpoint's `pageData` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub guid: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub main_info: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub number: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub publish_date: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_annuled: bool,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body_highlights: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub documents_with_hits: Vec<DocumentWithHit>,
    /// The item exactly as received, kept for the `list_item_raw` snapshot.
    #[serde(skip)]
    pub raw: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub found: i64,
    pub records: Vec<ListingRecord>,
    /// Items of `pageData` that could not be decoded into a record.
    pub rejected: usize,
}

impl ListingPage {
    /// True when the registry reports more hits than it returned in this page.
    pub fn is_truncated(&self) -> bool {
        self.found > (self.records.len() + self.rejected) as i64
    }
}

/// Parsed listing record ready for insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDraft {
    pub guid: String,
    pub kind: String,
    pub date: Option<NaiveDateTime>,
    pub number: String,
    pub contract: String,
    pub lessor: String,
    pub lessee: String,
    pub ogrn: String,
    pub inn: String,
    pub list_item_raw: JsonValue,
}

/// Persisted `contract` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRow {
    pub id: i64,
    pub guid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub date: Option<NaiveDateTime>,
    pub number: String,
    pub contract: String,
    pub lessor: String,
    pub lessee: String,
    pub ogrn: String,
    pub inn: String,
    pub stop_reason: String,
    pub user_comment: String,
    pub list_item_raw: JsonValue,
    pub item_raw: JsonValue,
    pub enriched: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Company {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub inn: String,
    #[serde(deserialize_with = "null_as_default")]
    pub ogrn: String,
}

/// `content` object of the detail endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DetailContent {
    #[serde(deserialize_with = "null_as_default")]
    pub stop_reason: String,
    #[serde(rename = "text", deserialize_with = "null_as_default")]
    pub comment: String,
    #[serde(deserialize_with = "null_as_default")]
    pub number: String,
    #[serde(deserialize_with = "null_as_default")]
    pub publish_date: String,
    #[serde(deserialize_with = "null_as_default")]
    pub lessors: Vec<Company>,
    #[serde(deserialize_with = "null_as_default")]
    pub lessees: Vec<Company>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DetailResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: DetailContent,
}

/// Column values written by the enrichment pass. Applying a patch always sets `enriched`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentPatch {
    pub user_comment: String,
    pub stop_reason: String,
    pub number: String,
    pub lessor: String,
    pub lessee: String,
    pub ogrn: String,
    pub inn: String,
    pub item_raw: JsonValue,
}

/// Inclusive one-day publish-date window sent to the listing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub day: NaiveDate,
}

pub const WINDOW_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

impl QueryWindow {
    pub fn for_day(day: NaiveDate) -> Self {
        Self { day }
    }

    pub fn start(&self) -> NaiveDateTime {
        self.day.and_time(NaiveTime::MIN)
    }

    pub fn end(&self) -> NaiveDateTime {
        // 23:59:59.999 is always a valid time of day.
        let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
        self.day.and_time(end_of_day)
    }

    pub fn start_param(&self) -> String {
        self.start().format(WINDOW_TIMESTAMP_FORMAT).to_string()
    }

    pub fn end_param(&self) -> String {
        self.end().format(WINDOW_TIMESTAMP_FORMAT).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextWindow {
    Window(QueryWindow),
    /// The next day has not finished yet; there is nothing to fetch.
    UpToDate { next_day: NaiveDate },
}

/// Decide which day to fetch next given the last synced day.
///
/// `fallback` stands in for the last synced day when nothing has been stored yet.
pub fn next_window(last_synced: Option<NaiveDate>, fallback: NaiveDate, today: NaiveDate) -> NextWindow {
    let last = last_synced.unwrap_or(fallback);
    let Some(next_day) = last.checked_add_days(Days::new(1)) else {
        return NextWindow::UpToDate { next_day: last };
    };
    if next_day >= today {
        NextWindow::UpToDate { next_day }
    } else {
        NextWindow::Window(QueryWindow::for_day(next_day))
    }
}

/// Bookkeeping for one executed daily window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub run_id: Uuid,
    pub window_day: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub found: i64,
    pub received: i64,
    pub inserted: i64,
    pub skipped: i64,
    pub duplicates: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn window_spans_whole_day_with_millisecond_bounds() {
        let window = QueryWindow::for_day(day(2023, 6, 2));
        assert_eq!(window.start_param(), "2023-06-02T00:00:00.000");
        assert_eq!(window.end_param(), "2023-06-02T23:59:59.999");
    }

    #[test]
    fn next_window_is_the_day_after_last_synced() {
        let next = next_window(Some(day(2023, 6, 1)), day(2020, 1, 1), day(2023, 6, 10));
        assert_eq!(next, NextWindow::Window(QueryWindow::for_day(day(2023, 6, 2))));
    }

    #[test]
    fn next_window_falls_back_when_nothing_synced() {
        let next = next_window(None, day(2023, 6, 1), day(2023, 6, 10));
        assert_eq!(next, NextWindow::Window(QueryWindow::for_day(day(2023, 6, 2))));
    }

    #[test]
    fn next_day_equal_to_today_is_up_to_date() {
        let next = next_window(Some(day(2023, 6, 9)), day(2020, 1, 1), day(2023, 6, 10));
        assert_eq!(next, NextWindow::UpToDate { next_day: day(2023, 6, 10) });

        let future = next_window(Some(day(2023, 6, 12)), day(2020, 1, 1), day(2023, 6, 10));
        assert!(matches!(future, NextWindow::UpToDate { .. }));
    }

    #[test]
    fn contract_type_codes_translate_and_unknown_pass_through() {
        assert_eq!(
            translate_contract_type("ChangeFinancialLeaseContract"),
            "Изменение договора финансовой аренды (лизинга)"
        );
        assert_eq!(translate_contract_type("SomethingElse"), "SomethingElse");
        assert!(is_origination(&translate_contract_type("FinancialLeaseContract")));
        assert!(is_origination(ORIGINATION_TYPE_LABEL));
    }

    #[test]
    fn detail_content_tolerates_missing_fields() {
        let parsed: DetailResponse =
            serde_json::from_str(r#"{"content":{"text":"note"}}"#).unwrap();
        assert_eq!(parsed.content.comment, "note");
        assert!(parsed.content.stop_reason.is_empty());
        assert!(parsed.content.lessors.is_empty());

        let nulls: DetailResponse = serde_json::from_str(
            r#"{"content":{"stopReason":null,"text":null,"lessors":null,"lessees":[{"name":null,"inn":"7701"}]}}"#,
        )
        .unwrap();
        assert!(nulls.content.comment.is_empty());
        assert_eq!(nulls.content.lessees[0].inn, "7701");
    }

    #[test]
    fn truncated_page_is_detected() {
        let page = ListingPage {
            found: 3,
            records: vec![],
            rejected: 0,
        };
        assert!(page.is_truncated());

        let all_rejected = ListingPage {
            found: 3,
            records: vec![],
            rejected: 3,
        };
        assert!(!all_rejected.is_truncated());
    }
}
