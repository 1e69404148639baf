//! Built-in scoring kernels.
//!
//! A manifest's `[[signals]]` list is a sum of kernels. Each kernel reads the
//! history (oldest first, most recent last) and adds a delta to some codes.
//!
//! | kind        | arguments                          | delta                                        |
//! |-------------|------------------------------------|----------------------------------------------|
//! | `frequency` | `window`, `weight`                 | weight × occurrences in the last window draws|
//! | `gap`       | `weight`, `cap` (30)               | weight × min(draws since last seen, cap)     |
//! | `repeat`    | `weight`, `lookback` (1)           | weight if seen in the last lookback draws    |
//! | `lag`       | `lag`, `weight`                    | weight if in the draw `lag` positions back   |
//! | `neighbor`  | `distance`, `weight`               | weight for codes ±distance of the last draw  |
//! | `digit`     | `position`, `window`, `weight`     | weight × count of the head/tail digit        |
//! | `follow`    | `window`, `weight`                 | weight × times it followed a last-draw code  |
//! | `weekday`   | `window` (weeks), `weight`         | weight × hits on the target's weekday        |
//!
//! Arguments are either numeric literals or names of declared parameters.
//! Count-like arguments must resolve to positive integers at predict time.

use std::collections::BTreeSet;

use chrono::{Datelike, Days, NaiveDate};
use serde::Deserialize;

use crate::error::PredictError;
use crate::types::{Code, ParamMap, ScoreVector, CODE_COUNT};

/// A kernel argument: literal number or parameter reference.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Literal(f64),
    Param(String),
}

impl Arg {
    fn resolve(&self, params: &ParamMap) -> Result<f64, PredictError> {
        match self {
            Arg::Literal(v) => Ok(*v),
            Arg::Param(name) => params
                .get(name)
                .map(|v| v.as_f64())
                .ok_or_else(|| PredictError::MissingParameter(name.clone())),
        }
    }

    fn count(&self, name: &'static str, params: &ParamMap) -> Result<usize, PredictError> {
        let value = self.resolve(params)?;
        if value.is_finite() && value >= 1.0 && value.fract() == 0.0 {
            Ok(value as usize)
        } else {
            Err(PredictError::InvalidArgument { name, value })
        }
    }

    pub fn param_name(&self) -> Option<&str> {
        match self {
            Arg::Param(name) => Some(name),
            Arg::Literal(_) => None,
        }
    }
}

fn one() -> Arg {
    Arg::Literal(1.0)
}

fn default_cap() -> Arg {
    Arg::Literal(30.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigitPosition {
    Head,
    Tail,
}

/// One `[[signals]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    Frequency {
        window: Arg,
        #[serde(default = "one")]
        weight: Arg,
    },
    Gap {
        weight: Arg,
        #[serde(default = "default_cap")]
        cap: Arg,
    },
    Repeat {
        weight: Arg,
        #[serde(default = "one")]
        lookback: Arg,
    },
    Lag {
        lag: Arg,
        weight: Arg,
    },
    Neighbor {
        distance: Arg,
        weight: Arg,
    },
    Digit {
        position: DigitPosition,
        window: Arg,
        weight: Arg,
    },
    Follow {
        window: Arg,
        weight: Arg,
    },
    Weekday {
        window: Arg,
        weight: Arg,
    },
}

/// History as seen by kernels: dates plus the predictor's extracted numbers.
pub struct HistoryView<'a> {
    pub dates: Vec<NaiveDate>,
    pub numbers: Vec<std::borrow::Cow<'a, BTreeSet<Code>>>,
}

impl HistoryView<'_> {
    fn len(&self) -> usize {
        self.numbers.len()
    }

    /// The last `n` draws (fewer if history is shorter).
    fn tail(&self, n: usize) -> &[std::borrow::Cow<'_, BTreeSet<Code>>] {
        &self.numbers[self.len().saturating_sub(n)..]
    }

    fn last(&self) -> Option<&BTreeSet<Code>> {
        self.numbers.last().map(|c| c.as_ref())
    }
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Frequency { .. } => "frequency",
            Signal::Gap { .. } => "gap",
            Signal::Repeat { .. } => "repeat",
            Signal::Lag { .. } => "lag",
            Signal::Neighbor { .. } => "neighbor",
            Signal::Digit { .. } => "digit",
            Signal::Follow { .. } => "follow",
            Signal::Weekday { .. } => "weekday",
        }
    }

    /// Every argument of this signal.
    pub fn args(&self) -> Vec<&Arg> {
        match self {
            Signal::Frequency { window, weight } => vec![window, weight],
            Signal::Gap { weight, cap } => vec![weight, cap],
            Signal::Repeat { weight, lookback } => vec![weight, lookback],
            Signal::Lag { lag, weight } => vec![lag, weight],
            Signal::Neighbor { distance, weight } => vec![distance, weight],
            Signal::Digit { window, weight, .. } => vec![window, weight],
            Signal::Follow { window, weight } => vec![window, weight],
            Signal::Weekday { window, weight } => vec![window, weight],
        }
    }

    /// Add this signal's deltas for `target` into `scores`.
    pub fn apply(
        &self,
        target: NaiveDate,
        history: &HistoryView<'_>,
        params: &ParamMap,
        scores: &mut ScoreVector,
    ) -> Result<(), PredictError> {
        match self {
            Signal::Frequency { window, weight } => {
                let window = window.count("window", params)?;
                let weight = weight.resolve(params)?;
                for draw in history.tail(window) {
                    for code in draw.iter() {
                        scores.add(*code, weight);
                    }
                }
            }
            Signal::Gap { weight, cap } => {
                let weight = weight.resolve(params)?;
                let cap = cap.count("cap", params)?;
                let mut gaps = [cap; CODE_COUNT];
                // Walk backwards; the first sighting of a code fixes its gap
                for (age, draw) in history.numbers.iter().rev().take(cap).enumerate() {
                    for code in draw.iter() {
                        let slot = &mut gaps[code.index()];
                        if *slot == cap {
                            *slot = age;
                        }
                    }
                }
                for code in Code::all() {
                    scores.add(code, weight * gaps[code.index()] as f64);
                }
            }
            Signal::Repeat { weight, lookback } => {
                let lookback = lookback.count("lookback", params)?;
                let weight = weight.resolve(params)?;
                let seen: BTreeSet<Code> = history
                    .tail(lookback)
                    .iter()
                    .flat_map(|d| d.iter().copied())
                    .collect();
                for code in seen {
                    scores.add(code, weight);
                }
            }
            Signal::Lag { lag, weight } => {
                let lag = lag.count("lag", params)?;
                let weight = weight.resolve(params)?;
                if let Some(idx) = history.len().checked_sub(lag) {
                    for code in history.numbers[idx].iter() {
                        scores.add(*code, weight);
                    }
                }
            }
            Signal::Neighbor { distance, weight } => {
                let distance = distance.count("distance", params)? as i64;
                let weight = weight.resolve(params)?;
                if let Some(last) = history.last() {
                    let neighbours: BTreeSet<Code> = last
                        .iter()
                        .flat_map(|c| {
                            let v = i64::from(c.value());
                            [Code::wrapping(v - distance), Code::wrapping(v + distance)]
                        })
                        .collect();
                    for code in neighbours {
                        scores.add(code, weight);
                    }
                }
            }
            Signal::Digit {
                position,
                window,
                weight,
            } => {
                let window = window.count("window", params)?;
                let weight = weight.resolve(params)?;
                let digit = |c: Code| match position {
                    DigitPosition::Head => c.head(),
                    DigitPosition::Tail => c.tail(),
                };
                let mut counts = [0usize; 10];
                for draw in history.tail(window) {
                    for code in draw.iter() {
                        counts[usize::from(digit(*code))] += 1;
                    }
                }
                for code in Code::all() {
                    scores.add(code, weight * counts[usize::from(digit(code))] as f64);
                }
            }
            Signal::Follow { window, weight } => {
                let window = window.count("window", params)?;
                let weight = weight.resolve(params)?;
                let Some(last) = history.last() else {
                    return Ok(());
                };
                // `window` consecutive (previous, next) pairs ending at the last draw
                let recent = history.tail(window + 1);
                for pair in recent.windows(2) {
                    let shared = pair[0].intersection(last).count();
                    if shared == 0 {
                        continue;
                    }
                    for code in pair[1].iter() {
                        scores.add(*code, weight * shared as f64);
                    }
                }
            }
            Signal::Weekday { window, weight } => {
                let weeks = window.count("window", params)?;
                let weight = weight.resolve(params)?;
                let since = target
                    .checked_sub_days(Days::new(7 * weeks as u64))
                    .unwrap_or(NaiveDate::MIN);
                let weekday = target.weekday();
                for (date, draw) in history.dates.iter().zip(history.numbers.iter()).rev() {
                    if *date < since {
                        break;
                    }
                    if date.weekday() == weekday {
                        for code in draw.iter() {
                            scores.add(*code, weight);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
