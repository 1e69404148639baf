//! Result store and number extraction.
//!
//! Two file layouts are accepted:
//!
//! ```text
//! [ {"date": "2024-03-01", "result": {"special": "12345", "g1": ["678", "90"]}}, ... ]
//! {"results": {"2024-03-01": {"special": "12345", ...}, ...}}
//! ```
//!
//! Dates may carry a trailing time (`2024-03-01T18:30:00`, `2024-03-01 18:30`),
//! which is dropped. Duplicate dates keep the first entry seen. Unknown
//! top-level fields are ignored.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{Code, DateRange, Draw};

/// Field names that never carry drawn numbers.
const ADMINISTRATIVE_KEYS: &[&str] = &[
    "date",
    "id",
    "province",
    "source",
    "timestamp",
    "time",
    "created_at",
    "updated_at",
    "fetched_at",
];

/// True for `date`, id-like keys, province, source and timestamp fields.
pub fn is_administrative_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ADMINISTRATIVE_KEYS.contains(&key.as_str())
        || key.starts_with('_')
        || key.ends_with("_id")
        || key.starts_with("id_")
        || key.ends_with("_at")
}

/// Extract the set of codes from one raw result mapping.
///
/// Each non-administrative field contributes every scalar value it holds
/// (arrays are flattened). A value ending in two digits yields those two
/// digits; a bare single digit is zero-padded; anything else is skipped.
/// `skip_fields` names additional fields to ignore.
pub fn extract_numbers(raw: &Map<String, Value>, skip_fields: &[String]) -> BTreeSet<Code> {
    let mut codes = BTreeSet::new();
    for (key, value) in raw {
        if is_administrative_key(key) || skip_fields.iter().any(|s| s == key) {
            continue;
        }
        collect_codes(value, &mut codes);
    }
    codes
}

fn collect_codes(value: &Value, out: &mut BTreeSet<Code>) {
    match value {
        Value::String(s) => {
            if let Some(code) = code_from_text(s) {
                out.insert(code);
            }
        }
        Value::Number(n) => {
            if let Some(code) = code_from_text(&n.to_string()) {
                out.insert(code);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_codes(item, out);
            }
        }
        Value::Null | Value::Bool(_) | Value::Object(_) => {}
    }
}

fn code_from_text(text: &str) -> Option<Code> {
    let text = text.trim();
    let bytes = text.as_bytes();
    match bytes.len() {
        0 => None,
        1 if bytes[0].is_ascii_digit() => Code::new(bytes[0] - b'0'),
        1 => None,
        n => {
            let (a, b) = (bytes[n - 2], bytes[n - 1]);
            if a.is_ascii_digit() && b.is_ascii_digit() {
                Code::new((a - b'0') * 10 + (b - b'0'))
            } else {
                None
            }
        }
    }
}

/// Parse `YYYY-MM-DD`, ignoring any trailing time component.
fn parse_draw_date(text: &str) -> Option<NaiveDate> {
    let day = text
        .trim()
        .split(|c: char| c == 'T' || c == ' ')
        .next()
        .unwrap_or_default();
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Chronologically sorted historical draws. Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    draws: Vec<Draw>,
}

impl ResultStore {
    /// Load and parse a results file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::DataFormat(format!("cannot read {}: {e}", path.display()))
        })?;
        let store = Self::from_json_str(&text)?;
        debug!(path = %path.display(), draws = store.len(), "loaded result store");
        Ok(store)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| Error::DataFormat(format!("invalid JSON: {e}")))?;

        let mut entries: Vec<(NaiveDate, Map<String, Value>)> = Vec::new();
        match root {
            Value::Array(items) => {
                for (idx, item) in items.into_iter().enumerate() {
                    let Value::Object(mut obj) = item else {
                        return Err(Error::DataFormat(format!("entry {idx} is not an object")));
                    };
                    let date = obj
                        .get("date")
                        .and_then(Value::as_str)
                        .and_then(parse_draw_date)
                        .ok_or_else(|| {
                            Error::DataFormat(format!("entry {idx} has no valid `date`"))
                        })?;
                    let result = match obj.remove("result") {
                        Some(Value::Object(result)) => result,
                        Some(_) => {
                            return Err(Error::DataFormat(format!(
                                "entry {idx}: `result` is not a mapping"
                            )))
                        }
                        // Flat entries carry their prizes next to `date`
                        None => obj,
                    };
                    entries.push((date, result));
                }
            }
            Value::Object(mut obj) => {
                let Some(Value::Object(results)) = obj.remove("results") else {
                    return Err(Error::DataFormat(
                        "expected a list of entries or a `results` mapping".into(),
                    ));
                };
                for (key, value) in results {
                    let date = parse_draw_date(&key)
                        .ok_or_else(|| Error::DataFormat(format!("invalid date key {key:?}")))?;
                    let Value::Object(result) = value else {
                        return Err(Error::DataFormat(format!("{key}: result is not a mapping")));
                    };
                    entries.push((date, result));
                }
            }
            _ => {
                return Err(Error::DataFormat(
                    "expected a list of entries or a `results` mapping".into(),
                ))
            }
        }

        let draws = entries
            .into_iter()
            .map(|(date, raw)| Draw {
                date,
                numbers: extract_numbers(&raw, &[]),
                raw,
            })
            .collect();
        Ok(Self::from_draws(draws))
    }

    /// Build a store from already-extracted draws (sorted, first date wins).
    pub fn from_draws(mut draws: Vec<Draw>) -> Self {
        // Stable sort keeps file order among equal dates, so dedup keeps the first
        draws.sort_by_key(|d| d.date);
        let before = draws.len();
        draws.dedup_by_key(|d| d.date);
        if draws.len() < before {
            warn!(duplicates = before - draws.len(), "dropped duplicate draw dates");
        }
        Self { draws }
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn draws(&self) -> &[Draw] {
        &self.draws
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.draws.first().map(|d| d.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.draws.last().map(|d| d.date)
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.draws.iter().map(|d| d.date)
    }

    pub fn get(&self, date: NaiveDate) -> Option<&Draw> {
        self.draws
            .binary_search_by_key(&date, |d| d.date)
            .ok()
            .map(|idx| &self.draws[idx])
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.get(date).is_some()
    }

    /// Draws dated within `range`, inclusive on both ends.
    pub fn range(&self, range: DateRange) -> &[Draw] {
        let lo = self.draws.partition_point(|d| d.date < range.start);
        let hi = self.draws.partition_point(|d| d.date <= range.end);
        &self.draws[lo..hi]
    }

    /// All draws strictly earlier than `date`.
    pub fn history_before(&self, date: NaiveDate) -> &[Draw] {
        let hi = self.draws.partition_point(|d| d.date < date);
        &self.draws[..hi]
    }
}
