//! Coordinate descent: one parameter at a time, walking while it pays.
//!
//! For each cycle, each parameter (declared order), each step magnitude and
//! each direction (`+` then `-`), the climber walks from the current best in
//! steps of that magnitude. A strictly better probe is adopted and resets the
//! stall counter; `stall_threshold` consecutive non-improving probes end the
//! walk. Once a direction has been adopted the opposite one is not tried for
//! that magnitude. A cycle that adopts nothing ends the search.

use std::collections::BTreeMap;

use super::{coerce_step, try_candidate, Best, Objective, SearchEnd, SearchObserver, SearchOutcome};
use crate::types::{round_real, ParamValue};

/// Relative size of the automatic step.
const AUTO_STEP_FRACTION: f64 = 0.05;

/// Automatic step for a parameter currently at `value`.
///
/// Integers: `max(1, round(|v| * 0.05))`. Reals: `max(epsilon, |v| * 0.05)`.
pub fn auto_step(value: ParamValue, epsilon: f64) -> f64 {
    match value {
        ParamValue::Int(v) => ((v as f64).abs() * AUTO_STEP_FRACTION).round().max(1.0),
        ParamValue::Float(v) => round_real((v.abs() * AUTO_STEP_FRACTION).max(epsilon)),
    }
}

#[derive(Debug, Clone)]
pub struct HillClimbOptions {
    pub max_cycles: usize,
    pub stall_threshold: usize,
    pub float_epsilon: f64,
    /// Explicit step magnitudes per parameter; others use [`auto_step`].
    pub custom_steps: BTreeMap<String, Vec<f64>>,
}

impl Default for HillClimbOptions {
    fn default() -> Self {
        Self {
            max_cycles: 5,
            stall_threshold: 2,
            float_epsilon: 0.001,
            custom_steps: BTreeMap::new(),
        }
    }
}

pub struct HillClimb<'a> {
    parameters: &'a [(String, ParamValue)],
    options: HillClimbOptions,
}

impl<'a> HillClimb<'a> {
    /// `parameters` fixes the visiting order and the declared kinds.
    pub fn new(parameters: &'a [(String, ParamValue)], options: HillClimbOptions) -> Self {
        Self {
            parameters,
            options,
        }
    }

    fn steps_for<S, W: SearchObserver<S>>(
        &self,
        name: &str,
        current: ParamValue,
        observer: &mut W,
    ) -> Vec<f64> {
        let Some(custom) = self.options.custom_steps.get(name) else {
            return vec![auto_step(current, self.options.float_epsilon)];
        };
        custom
            .iter()
            .filter_map(|step| {
                let usable = coerce_step(current.kind(), *step);
                if usable.is_none() {
                    observer.warn(&format!(
                        "skipping step {step} for integer parameter `{name}`"
                    ));
                }
                usable
            })
            .collect()
    }

    /// Climb from `start`, which must already be scored.
    pub fn run<O, W>(
        &self,
        objective: &mut O,
        observer: &mut W,
        start: Best<O::Report>,
    ) -> SearchOutcome<O::Report>
    where
        O: Objective,
        W: SearchObserver<O::Report>,
    {
        let mut best = Some(start);
        let mut improvements = 0;
        let mut evaluations = 0;
        let threshold = self.options.stall_threshold.max(1);

        for cycle in 1..=self.options.max_cycles {
            let mut improved_this_cycle = false;

            for (name, declared) in self.parameters {
                let current = |best: &Option<Best<O::Report>>| {
                    best.as_ref()
                        .and_then(|b| b.params.get(name))
                        .unwrap_or(*declared)
                };
                let steps = self.steps_for::<O::Report, W>(name, current(&best), observer);

                for step in steps {
                    for direction in [1.0, -1.0] {
                        let mut probe = current(&best);
                        let mut stall = 0;
                        let mut adopted = false;

                        while stall < threshold {
                            let Some(next) = probe.offset(direction * step) else {
                                break;
                            };
                            if !next.is_finite() {
                                break;
                            }
                            probe = next;

                            let mut candidate =
                                best.as_ref().map(|b| b.params.clone()).unwrap_or_default();
                            candidate.insert(name.as_str(), probe);

                            let result = try_candidate(objective, observer, &mut best, candidate);
                            evaluations += 1;
                            match result {
                                Ok(true) => {
                                    stall = 0;
                                    adopted = true;
                                    improvements += 1;
                                    improved_this_cycle = true;
                                }
                                Ok(false) => stall += 1,
                                Err(interrupt) => {
                                    let end = SearchEnd::Interrupted(interrupt);
                                    return finish(best, improvements, evaluations, end);
                                }
                            }
                            if let Err(interrupt) = observer.after_evaluation(evaluations, None) {
                                let end = SearchEnd::Interrupted(interrupt);
                                return finish(best, improvements, evaluations, end);
                            }
                        }
                        if adopted {
                            break;
                        }
                    }
                }
            }

            if !improved_this_cycle {
                observer.note(&format!("cycle {cycle}: no parameter improved"));
                return finish(best, improvements, evaluations, SearchEnd::NoImprovement);
            }
            observer.note(&format!("cycle {cycle} complete"));
        }

        finish(best, improvements, evaluations, SearchEnd::Completed)
    }
}

fn finish<S>(
    best: Option<Best<S>>,
    improvements: usize,
    evaluations: usize,
    end: SearchEnd,
) -> SearchOutcome<S> {
    SearchOutcome {
        best,
        improvements,
        evaluations,
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Interrupt, Result};
    use crate::search::Silent;
    use crate::types::{ParamMap, ScoreTuple};

    fn score(v: f64) -> ScoreTuple {
        ScoreTuple::new(v, 0.0, 0.0, 0.0)
    }

    fn params(pairs: &[(&str, ParamValue)]) -> ParamMap {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[derive(Default)]
    struct Recorder {
        scores: Vec<ScoreTuple>,
        warnings: Vec<String>,
        stop_after: Option<usize>,
    }

    impl SearchObserver<ScoreTuple> for Recorder {
        fn after_evaluation(
            &mut self,
            done: usize,
            _total: Option<usize>,
        ) -> std::result::Result<(), Interrupt> {
            match self.stop_after {
                Some(n) if done >= n => Err(Interrupt::TimeLimit),
                _ => Ok(()),
            }
        }

        fn improved(&mut self, best: &Best<ScoreTuple>) {
            self.scores.push(best.score());
        }

        fn warn(&mut self, text: &str) {
            self.warnings.push(text.to_string());
        }
    }

    #[test]
    fn test_auto_step() {
        assert_eq!(auto_step(ParamValue::Int(10), 0.001), 1.0);
        assert_eq!(auto_step(ParamValue::Int(0), 0.001), 1.0);
        assert_eq!(auto_step(ParamValue::Int(-100), 0.001), 5.0);
        assert_eq!(auto_step(ParamValue::Float(0.5), 0.001), 0.025);
        assert_eq!(auto_step(ParamValue::Float(0.0), 0.001), 0.001);
    }

    #[test]
    fn test_climbs_over_plateau_to_optimum() {
        let declared = vec![("w".to_string(), ParamValue::Int(10))];
        // 10 and 11 tie; 12 is the peak
        let mut objective = |p: &ParamMap| -> Result<ScoreTuple> {
            let w = p.get("w").unwrap().as_f64();
            Ok(score(if w == 12.0 { 100.0 } else { 0.0 }))
        };
        let start = Best::new(declared.iter().cloned().collect(), score(0.0));
        let mut recorder = Recorder::default();
        let outcome = HillClimb::new(&declared, HillClimbOptions::default())
            .run(&mut objective, &mut recorder, start);

        let best = outcome.best.unwrap();
        assert_eq!(best.params.get("w"), Some(ParamValue::Int(12)));
        assert_eq!(outcome.end, SearchEnd::NoImprovement);
        assert_eq!(outcome.improvements, 1);
        // +: 11, 12*, 13, 14 | cycle 2 +: 13, 14 -: 11, 10
        assert_eq!(outcome.evaluations, 8);
    }

    #[test]
    fn test_advertised_scores_strictly_increase() {
        let declared = vec![
            ("a".to_string(), ParamValue::Int(0)),
            ("b".to_string(), ParamValue::Float(1.0)),
        ];
        let mut objective = |p: &ParamMap| -> Result<ScoreTuple> {
            let a = p.get("a").unwrap().as_f64();
            let b = p.get("b").unwrap().as_f64();
            Ok(score(-(a - 4.0).powi(2) - (b - 0.5).powi(2)))
        };
        let initial: ParamMap = declared.iter().cloned().collect();
        let start = Best::new(initial.clone(), objective(&initial).unwrap());
        let mut options = HillClimbOptions::default();
        options.custom_steps.insert("b".into(), vec![0.25, 0.1]);
        options.max_cycles = 10;

        let mut recorder = Recorder::default();
        let outcome = HillClimb::new(&declared, options).run(&mut objective, &mut recorder, start);

        let best = outcome.best.unwrap();
        assert_eq!(best.params.get("a"), Some(ParamValue::Int(4)));
        assert_eq!(best.params.get("b"), Some(ParamValue::Float(0.5)));
        assert!(recorder.scores.windows(2).all(|w| w[1].beats(&w[0])));
        assert_eq!(outcome.end, SearchEnd::NoImprovement);
    }

    #[test]
    fn test_fractional_custom_step_skipped_for_integers() {
        let declared = vec![("n".to_string(), ParamValue::Int(3))];
        let mut options = HillClimbOptions::default();
        options.custom_steps.insert("n".into(), vec![0.5, 2.0]);
        let mut seen = Vec::new();
        let mut objective = |p: &ParamMap| -> Result<ScoreTuple> {
            seen.push(p.get("n").unwrap());
            Ok(score(0.0))
        };
        let mut recorder = Recorder::default();
        let start = Best::new(params(&[("n", ParamValue::Int(3))]), score(0.0));
        HillClimb::new(&declared, options).run(&mut objective, &mut recorder, start);

        assert_eq!(recorder.warnings.len(), 1);
        assert!(recorder.warnings[0].contains("0.5"));
        assert_eq!(
            seen,
            vec![ParamValue::Int(5), ParamValue::Int(7), ParamValue::Int(1), ParamValue::Int(-1)]
        );
    }

    #[test]
    fn test_interrupt_keeps_best() {
        let declared = vec![("w".to_string(), ParamValue::Int(0))];
        let mut objective = |p: &ParamMap| -> Result<ScoreTuple> {
            Ok(score(p.get("w").unwrap().as_f64()))
        };
        let mut recorder = Recorder {
            stop_after: Some(3),
            ..Default::default()
        };
        let start = Best::new(params(&[("w", ParamValue::Int(0))]), score(0.0));
        let outcome = HillClimb::new(&declared, HillClimbOptions::default())
            .run(&mut objective, &mut recorder, start);

        assert_eq!(outcome.end, SearchEnd::Interrupted(Interrupt::TimeLimit));
        assert_eq!(outcome.best.unwrap().params.get("w"), Some(ParamValue::Int(3)));
    }

    #[test]
    fn test_objective_interrupt_and_failures() {
        let declared = vec![("w".to_string(), ParamValue::Int(5))];
        let mut calls = 0;
        let mut objective = |_: &ParamMap| -> Result<ScoreTuple> {
            calls += 1;
            match calls {
                1 => Err(Error::Runtime("boom".into())),
                _ => Err(Error::Interrupted(Interrupt::Stopped)),
            }
        };
        let mut recorder = Recorder::default();
        let start = Best::new(params(&[("w", ParamValue::Int(5))]), score(1.0));
        let outcome = HillClimb::new(&declared, HillClimbOptions::default())
            .run(&mut objective, &mut recorder, start);

        assert_eq!(outcome.end, SearchEnd::Interrupted(Interrupt::Stopped));
        assert_eq!(outcome.best.unwrap().score(), score(1.0));
        assert_eq!(recorder.warnings.len(), 1);
        assert_eq!(outcome.evaluations, 2);
    }

    #[test]
    fn test_silent_observer_compiles_for_any_report() {
        let declared = vec![("w".to_string(), ParamValue::Int(1))];
        let mut objective = |_: &ParamMap| -> Result<ScoreTuple> { Ok(score(0.0)) };
        let start = Best::new(params(&[("w", ParamValue::Int(1))]), score(0.0));
        let options = HillClimbOptions {
            max_cycles: 1,
            ..Default::default()
        };
        let outcome = HillClimb::new(&declared, options).run(&mut objective, &mut Silent, start);
        assert_eq!(outcome.end, SearchEnd::NoImprovement);
    }
}
