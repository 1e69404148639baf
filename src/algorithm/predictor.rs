use std::borrow::Cow;
use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde_json::{Map, Value};

use super::kernels::HistoryView;
use super::{AlgorithmConfig, Manifest, Predictor};
use crate::error::PredictError;
use crate::store::extract_numbers;
use crate::types::{Code, Draw, ScoreVector};

/// A manifest bound to its parameter values, ready to predict.
#[derive(Debug, Clone)]
pub struct ManifestPredictor {
    manifest: Manifest,
    config: AlgorithmConfig,
}

impl ManifestPredictor {
    pub fn new(manifest: Manifest) -> Self {
        let config = AlgorithmConfig {
            description: manifest.description.clone(),
            parameters: manifest.parameters.clone(),
        };
        Self { manifest, config }
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

impl Predictor for ManifestPredictor {
    fn config(&self) -> &AlgorithmConfig {
        &self.config
    }

    fn predict(&self, target: NaiveDate, history: &[Draw]) -> Result<ScoreVector, PredictError> {
        // The store already extracted with no skip-fields; only re-read raw
        // results when this manifest narrows extraction.
        let numbers = history
            .iter()
            .map(|draw| {
                if self.manifest.skip_fields.is_empty() {
                    Cow::Borrowed(&draw.numbers)
                } else {
                    Cow::Owned(self.extract_numbers(&draw.raw))
                }
            })
            .collect();
        let view = HistoryView {
            dates: history.iter().map(|d| d.date).collect(),
            numbers,
        };

        let params = self.config.defaults();
        let mut scores = ScoreVector::default();
        for signal in &self.manifest.signals {
            signal.apply(target, &view, &params, &mut scores)?;
        }
        Ok(scores)
    }

    fn extract_numbers(&self, raw: &Map<String, Value>) -> BTreeSet<Code> {
        extract_numbers(raw, &self.manifest.skip_fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn draw(day: u32, raw: &str) -> Draw {
        let raw: Map<String, Value> = serde_json::from_str(raw).unwrap();
        Draw {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            numbers: extract_numbers(&raw, &[]),
            raw,
        }
    }

    #[test]
    fn test_skip_fields_apply_to_history() {
        let manifest = Manifest::parse(
            "[algorithm]\nclass = \"F\"\n[extract]\nskip-fields = [\"special\"]\n[[signals]]\nkind = \"frequency\"\nwindow = 5\n",
            Path::new("f.toml"),
        )
        .unwrap();
        let predictor = ManifestPredictor::new(manifest);
        let history = vec![
            draw(1, r#"{"special": "12345", "g1": "11"}"#),
            draw(2, r#"{"special": "00045", "g1": "11"}"#),
        ];
        let target = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let scores = predictor.predict(target, &history).unwrap();

        assert_eq!(scores.get(Code::new(11).unwrap()), 2.0);
        assert_eq!(scores.get(Code::new(45).unwrap()), 0.0);
    }

    #[test]
    fn test_predict_error_propagates() {
        let manifest = Manifest::parse(
            "[algorithm]\nclass = \"Broken\"\n[config.parameters]\nwindow = 0\n[[signals]]\nkind = \"frequency\"\nwindow = \"window\"\n",
            Path::new("broken.toml"),
        )
        .unwrap();
        let predictor = ManifestPredictor::new(manifest);
        let target = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let err = predictor.predict(target, &[draw(1, r#"{"a": "01"}"#)]).unwrap_err();
        assert_eq!(
            err,
            PredictError::InvalidArgument {
                name: "window",
                value: 0.0
            }
        );
    }
}
