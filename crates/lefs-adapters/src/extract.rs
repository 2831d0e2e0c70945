//! Field extraction from the registry's free-text `mainInfo` block.
//!
//! The block follows a loose template:
//!
//! ```text
//! Договор: № ЛД-77-1234/23 от 01.06.2023
//! Лизингодатель: ООО "Альфа-Лизинг", ОГРН: 1027700000001, ИНН: 7700000001
//! Лизингополучатель: ООО "Ромашка", ОГРН: 1157746000002, ИНН: 7701000002
//! ```
//!
//! Every extractor is independent and returns an empty string when its label is missing.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Timelike};
use regex::Regex;

pub const CONTRACT_LABEL: &str = "Договор:";
pub const LESSOR_LABEL: &str = "Лизингодатель:";
pub const LESSEE_LABEL: &str = "Лизингополучатель:";

/// Organizational-form prefixes stripped from company names.
pub const ORGANIZATION_PREFIXES: &[&str] = &["ООО "];

static RE_CONTRACT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Договор:[ \t]*([^\r\n]+)").unwrap());
static RE_LESSOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Лизингодатель:[ \t]*(.+?)[ \t]*(?:,\s*ОГРН|,\s*ИНН|\r?\n|Лизингополучатель|$)")
        .unwrap()
});
static RE_LESSEE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Лизингополучатель:[ \t]*([^,\r\n]+)").unwrap());
static RE_OGRN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"ОГРН:\s*(\d+)").unwrap());
static RE_INN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"ИНН:\s*(\d+)").unwrap());

fn first_capture(re: &Regex, text: &str) -> String {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default()
}

/// Text following the lessee label, where the lessee's OGRN/INN live.
fn lessee_section(main_info: &str) -> Option<&str> {
    main_info
        .find(LESSEE_LABEL)
        .map(|idx| &main_info[idx + LESSEE_LABEL.len()..])
}

pub fn trim_org_prefix(name: &str) -> String {
    let name = name.trim();
    ORGANIZATION_PREFIXES
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .unwrap_or(name)
        .trim()
        .to_string()
}

pub fn extract_contract(main_info: &str) -> String {
    first_capture(&RE_CONTRACT, main_info)
}

pub fn extract_lessor(main_info: &str) -> String {
    trim_org_prefix(&first_capture(&RE_LESSOR, main_info))
}

pub fn extract_lessee(main_info: &str) -> String {
    trim_org_prefix(&first_capture(&RE_LESSEE, main_info))
}

pub fn extract_ogrn(main_info: &str) -> String {
    lessee_section(main_info)
        .map(|section| first_capture(&RE_OGRN, section))
        .unwrap_or_default()
}

pub fn extract_inn(main_info: &str) -> String {
    lessee_section(main_info)
        .map(|section| first_capture(&RE_INN, section))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractedFields {
    pub contract: String,
    pub lessor: String,
    pub lessee: String,
    pub ogrn: String,
    pub inn: String,
}

pub fn extract_fields(main_info: &str) -> ExtractedFields {
    ExtractedFields {
        contract: extract_contract(main_info),
        lessor: extract_lessor(main_info),
        lessee: extract_lessee(main_info),
        ogrn: extract_ogrn(main_info),
        inn: extract_inn(main_info),
    }
}

/// Parse a registry publish timestamp, dropping any fractional seconds.
///
/// Accepts `2023-06-02T10:15:30.123` and RFC 3339 values with an offset (converted to UTC).
pub fn parse_publish_date(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let parsed = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.naive_utc())
        })?;
    parsed.with_nanosecond(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = "Договор: № ЛД-77-1234/23 от 01.06.2023\r\n\
        Лизингодатель: ООО \"Альфа-Лизинг\", ОГРН: 1027700000001, ИНН: 7700000001\r\n\
        Лизингополучатель: ООО \"Ромашка\", ОГРН: 1157746000002, ИНН: 7701000002\r\n\
        Предмет лизинга: Легковой автомобиль";

    #[test]
    fn extracts_every_labeled_segment() {
        let fields = extract_fields(BLOCK);
        assert_eq!(fields.contract, "№ ЛД-77-1234/23 от 01.06.2023");
        assert_eq!(fields.lessor, "\"Альфа-Лизинг\"");
        assert_eq!(fields.lessee, "\"Ромашка\"");
        assert_eq!(fields.ogrn, "1157746000002");
        assert_eq!(fields.inn, "7701000002");
    }

    #[test]
    fn lessor_ends_at_lessee_label_on_same_line() {
        let text = "Лизингодатель: АО Лизинг Лизингополучатель: ИП Иванов И.И.";
        assert_eq!(extract_lessor(text), "АО Лизинг");
        assert_eq!(extract_lessee(text), "ИП Иванов И.И.");
    }

    #[test]
    fn lessor_at_end_of_text_and_unix_newlines() {
        assert_eq!(extract_lessor("Лизингодатель: ООО Вектор"), "Вектор");
        let text = "Договор: 7/2023\nЛизингодатель: ООО Вектор\nЛизингополучатель: ООО Север";
        assert_eq!(extract_contract(text), "7/2023");
        assert_eq!(extract_lessor(text), "Вектор");
        assert_eq!(extract_lessee(text), "Север");
    }

    #[test]
    fn missing_labels_yield_empty_strings() {
        let text = "Предмет лизинга: Экскаватор";
        assert_eq!(extract_fields(text), ExtractedFields::default());
        assert_eq!(extract_fields(""), ExtractedFields::default());
    }

    #[test]
    fn empty_contract_value_does_not_swallow_next_line() {
        let text = "Договор:\r\nЛизингодатель: ООО Вектор";
        assert_eq!(extract_contract(text), "");
    }

    #[test]
    fn requisites_are_read_after_the_lessee_label_only() {
        let lessor_only = "Лизингодатель: ООО Вектор, ОГРН: 1027700000001, ИНН: 7700000001";
        assert_eq!(extract_ogrn(lessor_only), "");
        assert_eq!(extract_inn(lessor_only), "");

        let both = "Лизингодатель: ООО Вектор, ОГРН: 111, ИНН: 222\nЛизингополучатель: ООО Север, ИНН: 444";
        assert_eq!(extract_inn(both), "444");
        assert_eq!(extract_ogrn(both), "");
    }

    #[test]
    fn only_known_prefix_is_trimmed() {
        assert_eq!(trim_org_prefix("ООО Север"), "Север");
        assert_eq!(trim_org_prefix("  ПАО Север "), "ПАО Север");
    }

    #[test]
    fn publish_dates_drop_fractional_seconds() {
        let expected = NaiveDateTime::parse_from_str("2023-06-02 10:15:30", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(parse_publish_date("2023-06-02T10:15:30.123"), Some(expected));
        assert_eq!(parse_publish_date("2023-06-02T10:15:30"), Some(expected));
        assert_eq!(parse_publish_date("2023-06-02T13:15:30.5+03:00"), Some(expected));
        assert_eq!(parse_publish_date("not a date"), None);
        assert_eq!(parse_publish_date(""), None);
    }
}
