//! Core value types shared by every stage of the engine.
//!
//! Everything here is plain data: cheap to clone, serializable, and free of
//! I/O. The only invariants enforced at construction time are the ones that
//! would otherwise leak into every caller (codes are `00..=99`, ranges are
//! ordered).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of distinct codes (`"00"..="99"`).
pub const CODE_COUNT: usize = 100;

/// Base score every code starts from before deltas are summed.
pub const BASE_SCORE: f64 = 100.0;

/// A two-digit lottery number, `00..=99`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Code(u8);

impl Code {
    pub fn new(value: u8) -> Option<Self> {
        (usize::from(value) < CODE_COUNT).then_some(Self(value))
    }

    /// Wraps any integer onto the code ring (`-1 -> 99`, `100 -> 00`).
    pub fn wrapping(value: i64) -> Self {
        Self(value.rem_euclid(CODE_COUNT as i64) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Tens digit.
    pub fn head(self) -> u8 {
        self.0 / 10
    }

    /// Units digit.
    pub fn tail(self) -> u8 {
        self.0 % 10
    }

    pub fn all() -> impl Iterator<Item = Code> {
        (0..CODE_COUNT as u8).map(Code)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl FromStr for Code {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u8 = s.parse().map_err(|_| format!("not a code: {s:?}"))?;
        Code::new(value).ok_or_else(|| format!("code out of range: {s:?}"))
    }
}

impl Serialize for Code {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Code {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One day's actual result.
///
/// `numbers` is the store-level extraction; `raw` keeps the original prize
/// mapping so predictors with their own extraction rule can re-read it.
#[derive(Debug, Clone, PartialEq)]
pub struct Draw {
    pub date: NaiveDate,
    pub numbers: BTreeSet<Code>,
    pub raw: serde_json::Map<String, serde_json::Value>,
}

/// Per-code additive signal for one target date. Missing codes are 0.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreVector {
    deltas: [f64; CODE_COUNT],
}

impl Default for ScoreVector {
    fn default() -> Self {
        Self {
            deltas: [0.0; CODE_COUNT],
        }
    }
}

impl ScoreVector {
    pub fn get(&self, code: Code) -> f64 {
        self.deltas[code.index()]
    }

    pub fn add(&mut self, code: Code, delta: f64) {
        self.deltas[code.index()] += delta;
    }

    /// Adds `other` scaled by `weight` into `self`.
    pub fn accumulate(&mut self, other: &ScoreVector, weight: f64) {
        for (mine, theirs) in self.deltas.iter_mut().zip(other.deltas.iter()) {
            *mine += theirs * weight;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Code, f64)> + '_ {
        Code::all().map(|code| (code, self.deltas[code.index()]))
    }

    /// Codes ranked by `BASE_SCORE + delta` descending; ties go to the lower code.
    pub fn ranked(&self) -> Vec<Code> {
        let mut codes: Vec<Code> = Code::all().collect();
        codes.sort_by(|a, b| {
            let sa = BASE_SCORE + self.get(*a);
            let sb = BASE_SCORE + self.get(*b);
            sb.total_cmp(&sa).then(a.cmp(b))
        });
        codes
    }
}

impl FromIterator<(Code, f64)> for ScoreVector {
    fn from_iter<I: IntoIterator<Item = (Code, f64)>>(iter: I) -> Self {
        let mut scores = ScoreVector::default();
        for (code, delta) in iter {
            scores.add(code, delta);
        }
        scores
    }
}

/// Declared numeric type of a parameter. Fixed by the type of its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Integer,
    Real,
}

/// A numeric parameter value of a declared kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
}

/// Real-valued parameters are kept to this many decimals after stepping so
/// that `0.1 + 0.2` style noise never reaches an artifact.
const REAL_DECIMALS: i32 = 6;

pub fn round_real(value: f64) -> f64 {
    let scale = 10f64.powi(REAL_DECIMALS);
    (value * scale).round() / scale
}

impl ParamValue {
    pub fn kind(self) -> ParamKind {
        match self {
            ParamValue::Int(_) => ParamKind::Integer,
            ParamValue::Float(_) => ParamKind::Real,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            ParamValue::Int(v) => v as f64,
            ParamValue::Float(v) => v,
        }
    }

    pub fn is_finite(self) -> bool {
        self.as_f64().is_finite()
    }

    /// Converts to `kind`, refusing to truncate a non-integral real.
    pub fn coerce(self, kind: ParamKind) -> Option<ParamValue> {
        match (self, kind) {
            (ParamValue::Int(v), ParamKind::Integer) => Some(ParamValue::Int(v)),
            (ParamValue::Int(v), ParamKind::Real) => Some(ParamValue::Float(v as f64)),
            (ParamValue::Float(v), ParamKind::Real) => Some(ParamValue::Float(v)),
            (ParamValue::Float(v), ParamKind::Integer) => {
                (v.is_finite() && v.fract() == 0.0).then_some(ParamValue::Int(v as i64))
            }
        }
    }

    /// `self + delta`, keeping the declared kind.
    ///
    /// Returns `None` for integer parameters when `delta` is not integral.
    pub fn offset(self, delta: f64) -> Option<ParamValue> {
        match self {
            ParamValue::Int(v) => {
                (delta.fract() == 0.0).then(|| ParamValue::Int(v.saturating_add(delta as i64)))
            }
            ParamValue::Float(v) => Some(ParamValue::Float(round_real(v + delta))),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v:?}"),
        }
    }
}

/// A concrete assignment to an algorithm's numeric parameters.
///
/// Keys are kept sorted so equality and serialization are order-free; the
/// declared order lives on the descriptor and drives enumeration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamMap(BTreeMap<String, ParamValue>);

impl ParamMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<ParamValue> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) -> Option<ParamValue> {
        self.0.insert(name.into(), value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `self` with every entry of `overrides` applied on top.
    pub fn merged(&self, overrides: &ParamMap) -> ParamMap {
        let mut out = self.clone();
        for (name, value) in overrides.iter() {
            out.insert(name, value);
        }
        out
    }
}

impl<K: Into<String>> FromIterator<(K, ParamValue)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (K, ParamValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl fmt::Display for ParamMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Inclusive date range, serialized as `YYYY-MM-DD_to_YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Every calendar day in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn len_days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// The calendar day after `date`, saturating at the end of chrono's range.
pub fn next_day(date: NaiveDate) -> NaiveDate {
    date.checked_add_days(Days::new(1)).unwrap_or(date)
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_to_{}", self.start.format("%Y-%m-%d"), self.end.format("%Y-%m-%d"))
    }
}

impl FromStr for DateRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once("_to_")
            .ok_or_else(|| format!("expected START_to_END, got {s:?}"))?;
        let start = NaiveDate::parse_from_str(a, "%Y-%m-%d").map_err(|e| format!("{a}: {e}"))?;
        let end = NaiveDate::parse_from_str(b, "%Y-%m-%d").map_err(|e| format!("{b}: {e}"))?;
        DateRange::new(start, end).ok_or_else(|| format!("range start after end: {s:?}"))
    }
}

impl Serialize for DateRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DateRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// `(acc@3, acc@5, acc@1, -avg_top10_repetition)`, compared lexicographically.
///
/// Higher is better on every axis; the last one is negated so less repetition
/// wins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreTuple(pub [f64; 4]);

impl ScoreTuple {
    pub fn new(acc3: f64, acc5: f64, acc1: f64, avg_top10_repetition: f64) -> Self {
        Self([acc3, acc5, acc1, -avg_top10_repetition])
    }

    pub fn acc3(&self) -> f64 {
        self.0[0]
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }

    /// Equal on every axis up to `tolerance`.
    pub fn approx_eq(&self, other: &ScoreTuple, tolerance: f64) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    /// Strictly better under the lexicographic order.
    pub fn beats(&self, other: &ScoreTuple) -> bool {
        self.cmp_lex(other) == Ordering::Greater
    }

    pub fn cmp_lex(&self, other: &ScoreTuple) -> Ordering {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a.total_cmp(b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for ScoreTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(top3 {:.2}%, top5 {:.2}%, top1 {:.2}%, rep {:.3})",
            self.0[0], self.0[1], self.0[2], -self.0[3]
        )
    }
}
