//! Read-only checks over raw broker rows.

use std::collections::BTreeMap;

use chrono::{Datelike, Utc};
use fxb_core::{Broker, BrokerRef, RegulationTier};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

pub const REQUIRED_FIELDS: [&str; 3] = ["name", "slug", "country"];
pub const NUMERIC_FIELDS: [&str; 4] = ["established_year", "min_deposit", "spreads_avg", "trust_score"];
pub const ARRAY_FIELDS: [&str; 5] = ["platforms", "instruments", "regulations", "pros", "cons"];
pub const URL_FIELDS: [&str; 2] = ["logo_url", "website_url"];

pub const MIN_ESTABLISHED_YEAR: i32 = 1900;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub broker: BrokerRef,
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub checked: usize,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Warning)
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }

    pub fn is_valid(&self) -> bool {
        self.error_count() == 0
    }

    /// Slugs of rows that carry at least one error.
    pub fn slugs_with_errors(&self) -> Vec<String> {
        let mut slugs = self
            .errors()
            .map(|v| v.broker.slug.clone())
            .collect::<Vec<_>>();
        slugs.sort();
        slugs.dedup();
        slugs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Validator {
    current_year: i32,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self::with_current_year(Utc::now().year())
    }

    pub fn with_current_year(current_year: i32) -> Self {
        Self { current_year }
    }

    pub fn validate_brokers(&self, brokers: &[Broker]) -> ValidationReport {
        let rows = brokers
            .iter()
            .map(|b| serde_json::to_value(b).unwrap_or(JsonValue::Null))
            .collect::<Vec<_>>();
        self.validate_rows(&rows)
    }

    /// Checks every row and reports slug collisions against each row involved.
    pub fn validate_rows(&self, rows: &[JsonValue]) -> ValidationReport {
        let mut report = ValidationReport {
            checked: rows.len(),
            violations: Vec::new(),
        };
        let mut slugs: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (index, row) in rows.iter().enumerate() {
            let broker = BrokerRef::from_row(row);
            let mut push = |field: &str, severity: Severity, message: String| {
                report.violations.push(Violation {
                    broker: broker.clone(),
                    field: field.to_string(),
                    message,
                    severity,
                });
            };

            let Some(map) = row.as_object() else {
                push("<row>", Severity::Error, "row is not an object".to_string());
                continue;
            };

            for field in REQUIRED_FIELDS {
                match map.get(field) {
                    Some(JsonValue::String(s)) if !s.trim().is_empty() => {}
                    Some(JsonValue::String(_)) | Some(JsonValue::Null) | None => {
                        push(field, Severity::Error, "required field is empty".to_string())
                    }
                    Some(other) => push(
                        field,
                        Severity::Error,
                        format!("expected text, found {}", json_kind(other)),
                    ),
                }
            }

            for field in NUMERIC_FIELDS {
                let Some(value) = map.get(field).filter(|v| !v.is_null()) else {
                    continue;
                };
                let Some(number) = as_number(value) else {
                    push(
                        field,
                        Severity::Error,
                        format!("expected a number, found {}", describe(value)),
                    );
                    continue;
                };
                match field {
                    "min_deposit" | "spreads_avg" if number < 0.0 => push(
                        field,
                        Severity::Error,
                        format!("{number} is negative"),
                    ),
                    "trust_score" if !(0.0..=100.0).contains(&number) => push(
                        field,
                        Severity::Error,
                        format!("{number} is outside 0..=100"),
                    ),
                    "established_year"
                        if number.fract() != 0.0
                            || number < MIN_ESTABLISHED_YEAR as f64
                            || number > self.current_year as f64 =>
                    {
                        push(
                            field,
                            Severity::Error,
                            format!(
                                "{number} is not a year in {MIN_ESTABLISHED_YEAR}..={}",
                                self.current_year
                            ),
                        )
                    }
                    _ => {}
                }
            }

            for field in ARRAY_FIELDS {
                match map.get(field) {
                    None | Some(JsonValue::Null) => {}
                    Some(JsonValue::Array(items)) if items.is_empty() => {
                        push(field, Severity::Warning, "list is empty".to_string())
                    }
                    Some(JsonValue::Array(_)) => {}
                    Some(other) => push(
                        field,
                        Severity::Error,
                        format!("expected a list, found {}", json_kind(other)),
                    ),
                }
            }

            match map.get("regulation_tier") {
                None | Some(JsonValue::Null) => {}
                Some(JsonValue::String(tier))
                    if RegulationTier::STORED_VALUES.contains(&tier.as_str()) => {}
                Some(other) => push(
                    "regulation_tier",
                    Severity::Error,
                    format!(
                        "{} is not one of {}",
                        describe(other),
                        RegulationTier::STORED_VALUES.join(", ")
                    ),
                ),
            }

            for field in URL_FIELDS {
                match map.get(field) {
                    None | Some(JsonValue::Null) => {}
                    Some(JsonValue::String(s)) if s.trim().is_empty() => {
                        push(field, Severity::Warning, "URL is blank".to_string())
                    }
                    Some(JsonValue::String(s)) => {
                        if let Err(err) = Url::parse(s.trim()) {
                            push(field, Severity::Error, format!("invalid URL `{s}`: {err}"));
                        }
                    }
                    Some(other) => push(
                        field,
                        Severity::Error,
                        format!("expected a URL string, found {}", json_kind(other)),
                    ),
                }
            }

            // Exact comparison, the same one the `UNIQUE(slug)` constraint and slug upserts use.
            if let Some(slug) = map.get("slug").and_then(|v| v.as_str()) {
                if !slug.trim().is_empty() {
                    slugs.entry(slug.to_string()).or_default().push(index);
                }
            }
        }

        for (slug, indexes) in slugs.into_iter().filter(|(_, idx)| idx.len() > 1) {
            for index in &indexes {
                report.violations.push(Violation {
                    broker: BrokerRef::from_row(&rows[*index]),
                    field: "slug".to_string(),
                    message: format!(
                        "duplicate slug `{slug}` shared with {} other broker(s)",
                        indexes.len() - 1
                    ),
                    severity: Severity::Error,
                });
            }
        }

        report
    }
}

fn as_number(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "text",
        JsonValue::Array(_) => "a list",
        JsonValue::Object(_) => "an object",
    }
}

fn describe(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => format!("`{s}`"),
        other => json_kind(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_row(slug: &str) -> JsonValue {
        json!({
            "id": 1,
            "name": "IG Markets",
            "slug": slug,
            "country": "United Kingdom",
            "established_year": 1974,
            "min_deposit": 250,
            "spreads_avg": "0.6",
            "platforms": ["MT4"],
            "instruments": ["Forex"],
            "regulations": ["FCA"],
            "regulation_tier": "tier1",
            "trust_score": 50,
            "pros": ["Long track record"],
            "cons": ["Inactivity fee"],
            "logo_url": "https://cdn.example.com/ig.png",
            "website_url": null
        })
    }

    fn validator() -> Validator {
        Validator::with_current_year(2026)
    }

    #[test]
    fn trust_score_in_range_is_valid() {
        let report = validator().validate_rows(&[valid_row("ig-markets")]);
        assert!(report.is_valid(), "{:?}", report.violations);
        assert_eq!(report.warning_count(), 0);
    }

    #[test]
    fn trust_score_above_hundred_is_an_error() {
        let mut row = valid_row("ig-markets");
        row["trust_score"] = json!(150);
        let report = validator().validate_rows(&[row]);
        let errors = report.errors().collect::<Vec<_>>();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "trust_score");
    }

    #[test]
    fn negative_deposit_and_spread_are_errors() {
        let mut row = valid_row("ig-markets");
        row["min_deposit"] = json!(-1);
        row["spreads_avg"] = json!("-0.2");
        let report = validator().validate_rows(&[row]);
        let mut fields = report.errors().map(|v| v.field.as_str()).collect::<Vec<_>>();
        fields.sort();
        assert_eq!(fields, vec!["min_deposit", "spreads_avg"]);
    }

    #[test]
    fn shared_slug_is_reported_on_every_broker() {
        let mut second = valid_row("ig-markets");
        second["id"] = json!(2);
        second["name"] = json!("IG Group");
        let report = validator().validate_rows(&[valid_row("ig-markets"), second, valid_row("oanda")]);

        let dupes = report
            .errors()
            .filter(|v| v.field == "slug")
            .map(|v| v.broker.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(dupes, vec!["IG Markets", "IG Group"]);
    }

    #[test]
    fn slugs_differing_only_in_case_are_distinct() {
        let mut upper = valid_row("IG-Markets");
        upper["id"] = json!(2);
        let report = validator().validate_rows(&[valid_row("ig-markets"), upper]);
        assert!(report.is_valid(), "{:?}", report.violations);
    }

    #[test]
    fn type_errors_are_errors_and_empty_lists_are_warnings() {
        let row = json!({
            "name": "  ",
            "slug": "acme",
            "country": 44,
            "min_deposit": "fifty",
            "platforms": "MT4",
            "pros": [],
            "regulation_tier": "unknown",
            "website_url": "not a url",
            "logo_url": ""
        });
        let report = validator().validate_rows(&[row]);
        let mut error_fields = report.errors().map(|v| v.field.as_str()).collect::<Vec<_>>();
        error_fields.sort();
        assert_eq!(
            error_fields,
            vec!["country", "min_deposit", "name", "platforms", "regulation_tier", "website_url"]
        );
        let mut warning_fields = report.warnings().map(|v| v.field.as_str()).collect::<Vec<_>>();
        warning_fields.sort();
        assert_eq!(warning_fields, vec!["logo_url", "pros"]);
    }

    #[test]
    fn established_year_bounds_follow_current_year() {
        let mut row = valid_row("ig-markets");
        row["established_year"] = json!(2027);
        assert_eq!(validator().validate_rows(&[row.clone()]).error_count(), 1);
        assert!(Validator::with_current_year(2027).validate_rows(&[row.clone()]).is_valid());
        row["established_year"] = json!(1899);
        assert_eq!(validator().validate_rows(&[row]).error_count(), 1);
    }

    #[test]
    fn validation_does_not_mutate_input() {
        let rows = vec![valid_row("ig-markets"), json!("garbage")];
        let before = rows.clone();
        let report = validator().validate_rows(&rows);
        assert_eq!(rows, before);
        assert_eq!(report.checked, 2);
        assert_eq!(report.error_count(), 1);
    }

    #[test]
    fn typed_brokers_validate_through_the_same_rules() {
        let mut broker = Broker::new("Pepperstone", "pepperstone");
        broker.country = Some("Australia".to_string());
        broker.trust_score = Some(101);
        let report = validator().validate_brokers(&[broker]);
        assert_eq!(report.slugs_with_errors(), vec!["pepperstone".to_string()]);
    }
}
