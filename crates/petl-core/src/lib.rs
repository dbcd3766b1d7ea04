//! Core domain model for partner posting ETL: quarters, partners, postings and stats records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Datelike;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "petl-core";

/// Calendar quarter used as the time-partition key, written as `2013Q2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quarter {
    year: i32,
    quarter: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuarterParseError {
    #[error("quarter `{0}` is not of the form YYYYQn")]
    Malformed(String),
    #[error("quarter number {0} is outside 1..=4")]
    OutOfRange(u8),
}

impl Quarter {
    pub fn new(year: i32, quarter: u8) -> Result<Self, QuarterParseError> {
        if !(1..=4).contains(&quarter) {
            return Err(QuarterParseError::OutOfRange(quarter));
        }
        Ok(Self { year, quarter })
    }

    /// Quarter containing the given date or datetime.
    pub fn from_date<D: Datelike>(date: &D) -> Self {
        Self {
            year: date.year(),
            quarter: (date.month0() / 3 + 1) as u8,
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn quarter(&self) -> u8 {
        self.quarter
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Q{}", self.year, self.quarter)
    }
}

impl FromStr for Quarter {
    type Err = QuarterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || QuarterParseError::Malformed(s.to_string());
        let (year, quarter) = s.split_once('Q').ok_or_else(malformed)?;
        if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        if quarter.len() != 1 || !quarter.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let year = year.parse().map_err(|_| malformed())?;
        let quarter = quarter.parse().map_err(|_| malformed())?;
        Self::new(year, quarter)
    }
}

impl TryFrom<String> for Quarter {
    type Error = QuarterParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quarter> for String {
    fn from(value: Quarter) -> Self {
        value.to_string()
    }
}

/// Partner (dataset) identifier. Restricted to ASCII alphanumerics and `-` so that
/// the `{partner_id}_` batch prefix never matches another partner's blobs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartnerId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartnerIdError {
    #[error("partner id must not be empty")]
    Empty,
    #[error("partner id `{0}` may only contain ASCII letters, digits and `-`")]
    InvalidCharacter(String),
}

impl PartnerId {
    pub fn new(id: impl Into<String>) -> Result<Self, PartnerIdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PartnerIdError::Empty);
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(PartnerIdError::InvalidCharacter(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PartnerId {
    type Err = PartnerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PartnerId {
    type Error = PartnerIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PartnerId> for String {
    fn from(value: PartnerId) -> Self {
        value.0
    }
}

/// Opaque job posting. Always a JSON object; this layer defines no fields of its own.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Posting(Map<String, Value>);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("posting must be a JSON object, got {0}")]
pub struct NotAnObject(pub &'static str);

impl Posting {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    /// Keys whose value carries data: not null, not an empty string, array or object.
    pub fn populated_keys(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, value)| match value {
                Value::Null => false,
                Value::String(s) => !s.is_empty(),
                Value::Array(a) => !a.is_empty(),
                Value::Object(o) => !o.is_empty(),
                Value::Bool(_) | Value::Number(_) => true,
            })
            .map(|(key, _)| key.as_str())
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl TryFrom<Value> for Posting {
    type Error = NotAnObject;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Err(NotAnObject("null")),
            Value::Bool(_) => Err(NotAnObject("a boolean")),
            Value::Number(_) => Err(NotAnObject("a number")),
            Value::String(_) => Err(NotAnObject("a string")),
            Value::Array(_) => Err(NotAnObject("an array")),
        }
    }
}

/// Blob key prefix shared by every batch file of one partner-quarter.
pub fn batch_key_prefix(output_prefix: &str, quarter: Quarter, partner_id: &PartnerId) -> String {
    format!("{output_prefix}/{quarter}/{partner_id}_")
}

pub fn quarterly_stats_key(stats_prefix: &str, quarter: Quarter, partner_id: &PartnerId) -> String {
    format!("{stats_prefix}/quarterly/{quarter}/{partner_id}.json")
}

pub fn quarterly_stats_prefix(stats_prefix: &str) -> String {
    format!("{stats_prefix}/quarterly/")
}

pub fn dataset_summary_key(stats_prefix: &str, partner_id: &PartnerId) -> String {
    format!("{stats_prefix}/dataset_summaries/{partner_id}.json")
}

pub fn dataset_summaries_prefix(stats_prefix: &str) -> String {
    format!("{stats_prefix}/dataset_summaries/")
}

pub fn global_summary_key(stats_prefix: &str) -> String {
    format!("{stats_prefix}/total.json")
}

/// Manifest entry for one uploaded batch file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub key: String,
    pub postings: u64,
    pub bytes: u64,
    pub sha256: String,
}

/// Stats for one partner-quarter dataset generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub dataset_id: PartnerId,
    pub quarter: Quarter,
    pub total: u64,
    pub field_presence: BTreeMap<String, u64>,
    #[serde(default)]
    pub batches: Vec<BatchRecord>,
}

/// Folds postings into a [`DatasetStats`] as the ingest loop consumes them.
#[derive(Debug, Clone)]
pub struct DatasetStatsCounter {
    stats: DatasetStats,
}

impl DatasetStatsCounter {
    pub fn new(quarter: Quarter, dataset_id: PartnerId) -> Self {
        Self {
            stats: DatasetStats {
                dataset_id,
                quarter,
                total: 0,
                field_presence: BTreeMap::new(),
                batches: Vec::new(),
            },
        }
    }

    pub fn track(&mut self, posting: &Posting) {
        self.stats.total += 1;
        for key in posting.populated_keys() {
            *self.stats.field_presence.entry(key.to_string()).or_default() += 1;
        }
    }

    pub fn record_batch(&mut self, batch: BatchRecord) {
        self.stats.batches.push(batch);
    }

    pub fn stats(&self) -> &DatasetStats {
        &self.stats
    }

    pub fn into_stats(self) -> DatasetStats {
        self.stats
    }
}

/// Per-partner reduction over every quarter's [`DatasetStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSummary {
    pub dataset_id: PartnerId,
    pub total: u64,
    pub field_presence: BTreeMap<String, u64>,
    pub quarters: BTreeMap<Quarter, u64>,
}

impl DatasetSummary {
    pub fn empty(dataset_id: PartnerId) -> Self {
        Self {
            dataset_id,
            total: 0,
            field_presence: BTreeMap::new(),
            quarters: BTreeMap::new(),
        }
    }

    /// Records for other datasets are ignored. A repeated quarter replaces the earlier one.
    pub fn from_stats(dataset_id: PartnerId, stats: impl IntoIterator<Item = DatasetStats>) -> Self {
        let mut by_quarter: BTreeMap<Quarter, DatasetStats> = BTreeMap::new();
        for record in stats {
            if record.dataset_id == dataset_id {
                by_quarter.insert(record.quarter, record);
            }
        }

        let mut summary = Self::empty(dataset_id);
        for (quarter, record) in by_quarter {
            summary.total += record.total;
            summary.quarters.insert(quarter, record.total);
            merge_counts(&mut summary.field_presence, &record.field_presence);
        }
        summary
    }
}

/// Reduction over every partner's [`DatasetSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub total: u64,
    pub field_presence: BTreeMap<String, u64>,
    pub partners: BTreeMap<PartnerId, u64>,
    pub quarters: BTreeMap<Quarter, u64>,
}

impl GlobalSummary {
    pub fn from_summaries(summaries: impl IntoIterator<Item = DatasetSummary>) -> Self {
        let mut by_partner: BTreeMap<PartnerId, DatasetSummary> = BTreeMap::new();
        for summary in summaries {
            by_partner.insert(summary.dataset_id.clone(), summary);
        }

        let mut global = Self::default();
        for (partner_id, summary) in by_partner {
            global.total += summary.total;
            global.partners.insert(partner_id, summary.total);
            merge_counts(&mut global.field_presence, &summary.field_presence);
            for (quarter, total) in summary.quarters {
                *global.quarters.entry(quarter).or_default() += total;
            }
        }
        global
    }
}

fn merge_counts(into: &mut BTreeMap<String, u64>, from: &BTreeMap<String, u64>) {
    for (key, count) in from {
        *into.entry(key.clone()).or_default() += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn partner(id: &str) -> PartnerId {
        PartnerId::new(id).expect("partner id")
    }

    fn quarter(s: &str) -> Quarter {
        s.parse().expect("quarter")
    }

    fn posting(value: Value) -> Posting {
        Posting::try_from(value).expect("posting object")
    }

    #[test]
    fn quarter_follows_calendar_months() {
        let cases = [(1, 1), (3, 1), (4, 2), (5, 2), (7, 3), (9, 3), (10, 4), (12, 4)];
        for (month, expected) in cases {
            let date = NaiveDate::from_ymd_opt(2013, month, 15).expect("date");
            let q = Quarter::from_date(&date);
            assert_eq!(q.year(), 2013);
            assert_eq!(q.quarter(), expected, "month {month}");
        }
        let date = NaiveDate::from_ymd_opt(2013, 5, 1).expect("date");
        assert_eq!(Quarter::from_date(&date).to_string(), "2013Q2");
    }

    #[test]
    fn quarter_parse_rejects_malformed_input() {
        assert_eq!(quarter("2014Q4"), Quarter::new(2014, 4).expect("q"));
        for bad in ["2014Q5", "2014Q0", "2014-Q1", "14Q1", "2014Q12", "Q1", "2014q1", ""] {
            assert!(bad.parse::<Quarter>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn quarters_order_chronologically_and_serialize_as_map_keys() {
        let mut quarters = vec![quarter("2014Q1"), quarter("2013Q4"), quarter("2013Q2")];
        quarters.sort();
        assert_eq!(
            quarters.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["2013Q2", "2013Q4", "2014Q1"]
        );

        let mut map = BTreeMap::new();
        map.insert(quarter("2013Q2"), 5u64);
        let text = serde_json::to_string(&map).expect("serialize");
        assert_eq!(text, r#"{"2013Q2":5}"#);
        let back: BTreeMap<Quarter, u64> = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, map);
    }

    #[test]
    fn partner_ids_reject_prefix_ambiguous_characters() {
        assert!(PartnerId::new("usajobs").is_ok());
        assert!(PartnerId::new("nlx-research").is_ok());
        assert_eq!(PartnerId::new(""), Err(PartnerIdError::Empty));
        assert!(PartnerId::new("p1_old").is_err());
        assert!(PartnerId::new("a/b").is_err());
        assert!(serde_json::from_str::<PartnerId>(r#""bad id""#).is_err());
    }

    #[test]
    fn batch_prefix_matches_key_layout() {
        assert_eq!(
            batch_key_prefix("prefix", quarter("2013Q2"), &partner("P1")),
            "prefix/2013Q2/P1_"
        );
        assert_eq!(
            quarterly_stats_key("stats", quarter("2013Q2"), &partner("P1")),
            "stats/quarterly/2013Q2/P1.json"
        );
    }

    #[test]
    fn non_object_postings_are_rejected() {
        assert!(Posting::try_from(json!([1, 2])).is_err());
        assert!(Posting::try_from(json!("text")).is_err());
        assert!(Posting::try_from(json!({"title": "Nurse"})).is_ok());
    }

    #[test]
    fn counter_tracks_populated_fields_only() {
        let mut counter = DatasetStatsCounter::new(quarter("2013Q2"), partner("P1"));
        counter.track(&posting(json!({"title": "Nurse", "skills": ["care"], "salary": null})));
        counter.track(&posting(json!({"title": "", "skills": [], "remote": false})));

        let stats = counter.into_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.field_presence.get("title"), Some(&1));
        assert_eq!(stats.field_presence.get("skills"), Some(&1));
        assert_eq!(stats.field_presence.get("remote"), Some(&1));
        assert_eq!(stats.field_presence.get("salary"), None);
    }

    #[test]
    fn summaries_reduce_across_quarters_and_partners() {
        let mut a = DatasetStatsCounter::new(quarter("2013Q2"), partner("P1"));
        a.track(&posting(json!({"title": "A"})));
        a.track(&posting(json!({"title": "B"})));
        let mut b = DatasetStatsCounter::new(quarter("2013Q3"), partner("P1"));
        b.track(&posting(json!({"title": "C", "city": "Chicago"})));
        let mut other = DatasetStatsCounter::new(quarter("2013Q2"), partner("P2"));
        other.track(&posting(json!({"city": "Austin"})));

        let p1 = DatasetSummary::from_stats(
            partner("P1"),
            vec![a.into_stats(), b.into_stats(), other.stats().clone()],
        );
        assert_eq!(p1.total, 3);
        assert_eq!(p1.quarters.get(&quarter("2013Q2")), Some(&2));
        assert_eq!(p1.field_presence.get("title"), Some(&3));

        let p2 = DatasetSummary::from_stats(partner("P2"), vec![other.into_stats()]);
        let global = GlobalSummary::from_summaries(vec![p1.clone(), p2]);
        assert_eq!(global.total, 4);
        assert_eq!(global.partners.len(), 2);
        assert_eq!(global.quarters.get(&quarter("2013Q2")), Some(&3));
        assert_eq!(global.field_presence.get("city"), Some(&2));

        let again = GlobalSummary::from_summaries(vec![p1.clone(), p1]);
        assert_eq!(again.total, 3, "a repeated partner summary is not double counted");
    }
}
