//! End-to-end sessions through the public controller API.
//!
//! The synthetic history repeats every 13 days: day `i` draws the five codes
//! `7·(i mod 13) .. 7·(i mod 13)+4`. A `lag` kernel therefore hits every day
//! exactly when it looks 12 draws back, and never otherwise.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, Local, NaiveDate, TimeZone};
use regex::Regex;
use tempfile::TempDir;

use lotopt::artifacts::ArtifactMetadata;
use lotopt::evaluation::{HitCounts, Unchecked};
use lotopt::rewrite::{extract_parameters, rewrite_source};
use lotopt::search::Progress;
use lotopt::{
    ArtifactManager, Code, Config, Controller, DateRange, Draw, Error, EvaluationResult,
    FinishReason, GenerationOptions, ParamMap, ParamValue, Registry, ResultStore, ResumeFrom,
    ScoreTuple, SearchMode, SessionConfig, SessionEvent, SessionState,
};

const PERIOD: u64 = 13;

fn lag_manifest(default: i64) -> String {
    format!(
        r#"# ID: 100200
# Version: 1.0.0

[algorithm]
class = "LagEcho"
name = "Lag echo"

[config]
description = "Repeats the draw w days back"

[config.parameters]
w = {default}   # draws back

[[signals]]
kind = "lag"
lag = "w"
weight = 1.0
"#
    )
}

/// Every `predict` fails: a zero window is not a valid count.
const BROKEN: &str = r#"[algorithm]
class = "Broken"

[config.parameters]
window = 0

[[signals]]
kind = "frequency"
window = "window"
"#;

const HOT: &str = r#"[algorithm]
class = "Hot"

[config.parameters]
window = 5

[[signals]]
kind = "frequency"
window = "window"
weight = 0.1
"#;

fn day0() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn day(i: u64) -> NaiveDate {
    day0().checked_add_days(Days::new(i)).unwrap()
}

fn periodic_draw(i: u64) -> Draw {
    let base = (i % PERIOD) as u8 * 7;
    Draw {
        date: day(i),
        numbers: (0..5).map(|j| Code::new(base + j).unwrap()).collect(),
        raw: Default::default(),
    }
}

/// Days `0..days`, minus `missing`.
fn store(days: u64, missing: &[u64]) -> ResultStore {
    ResultStore::from_draws(
        (0..days)
            .filter(|i| !missing.contains(i))
            .map(periodic_draw)
            .collect(),
    )
}

struct Lab {
    _dir: TempDir,
    config: Config,
    controller: Controller,
}

fn lab(manifests: &[(&str, &str)], throttle_ms: u64) -> Lab {
    lab_with_store(manifests, throttle_ms, store(60, &[]))
}

fn lab_with_store(manifests: &[(&str, &str)], throttle_ms: u64, results: ResultStore) -> Lab {
    let dir = tempfile::tempdir().unwrap();
    let algorithms = dir.path().join("algorithms");
    fs::create_dir_all(&algorithms).unwrap();
    for (name, text) in manifests {
        fs::write(algorithms.join(name), text).unwrap();
    }
    let config = Config {
        algorithms_dir: algorithms,
        optimize_dir: dir.path().join("optimize"),
        scratch_dir: dir.path().join("scratch"),
        throttle_ms,
        ..Config::default()
    };
    let mut registry = Registry::from_config(&config);
    let report = registry.scan().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    let controller = Controller::new(config.clone(), Arc::new(results), Arc::new(registry));
    Lab {
        _dir: dir,
        config,
        controller,
    }
}

fn range() -> DateRange {
    DateRange::new(day(20), day(49)).unwrap()
}

fn session(target: &str) -> SessionConfig {
    SessionConfig::new(target, range(), Duration::from_secs(60))
}

fn finished(events: &[SessionEvent]) -> (FinishReason, bool) {
    let finals: Vec<_> = events.iter().filter(|e| e.is_finished()).collect();
    assert_eq!(finals.len(), 1, "exactly one finished event: {events:?}");
    assert!(events.last().unwrap().is_finished(), "finished must be last");
    match finals[0] {
        SessionEvent::Finished { reason, success, .. } => (*reason, *success),
        _ => unreachable!(),
    }
}

fn best_updates(events: &[SessionEvent]) -> Vec<(ParamMap, ScoreTuple)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::BestUpdate {
                params,
                score_tuple,
            } => Some((params.clone(), *score_tuple)),
            _ => None,
        })
        .collect()
}

fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

fn assert_strictly_increasing(updates: &[(ParamMap, ScoreTuple)]) {
    for pair in updates.windows(2) {
        assert!(
            pair[1].1.beats(&pair[0].1),
            "best_update went from {} to {}",
            pair[0].1,
            pair[1].1
        );
    }
}

#[test]
fn hill_climb_finds_the_period() {
    let lab = lab(&[("echo.toml", &lag_manifest(10))], 0);
    let handle = lab.controller.start(session("echo")).unwrap();
    let events = handle.wait();

    let (reason, success) = finished(&events);
    assert_eq!(reason, FinishReason::NoImprovement);
    assert!(success);

    let updates = best_updates(&events);
    assert!(updates.len() >= 2, "{updates:?}");
    assert_strictly_increasing(&updates);
    let (params, score) = updates.last().unwrap();
    assert_eq!(params.get("w"), Some(ParamValue::Int(12)));
    assert_eq!(score.acc3(), 100.0);

    let success_dir = lab.config.optimize_dir.join("echo").join("success");
    let pattern = Regex::new(r"^opt_echo_top3_\d+\.\d_\d{14}(_\d+)?\.(json|toml)$").unwrap();
    let names = files_in(&success_dir);
    assert!(!names.is_empty());
    assert!(names.iter().all(|n| pattern.is_match(n)), "{names:?}");
    assert!(names.iter().any(|n| n.starts_with("opt_echo_top3_100.0_")));

    // The best artifact is a loadable manifest carrying w = 12
    let best = ArtifactManager::new(&lab.config.optimize_dir).list("echo").unwrap();
    let source = fs::read_to_string(&best[0].paths.source).unwrap();
    assert!(source.contains("w = 12   # draws back"), "{source}");
    assert_eq!(best[0].metadata.finish_reason.as_deref(), Some("no_improvement"));

    let state = ArtifactManager::new(&lab.config.optimize_dir)
        .read_state("echo")
        .unwrap()
        .unwrap();
    assert_eq!(state.save_reason, "no_improvement");
    assert_eq!(state.params.get("w"), Some(ParamValue::Int(12)));
}

#[test]
fn resume_latest_starts_from_the_saved_best() {
    let lab = lab(&[("echo.toml", &lag_manifest(10))], 0);
    lab.controller.start(session("echo")).unwrap().wait();

    let mut again = session("echo");
    again.resume_from = Some(ResumeFrom::Latest);
    let events = lab.controller.start(again).unwrap().wait();

    let (reason, _) = finished(&events);
    assert_eq!(reason, FinishReason::NoImprovement);
    let updates = best_updates(&events);
    assert_eq!(updates.len(), 1, "already at the optimum: {updates:?}");
    assert_eq!(updates[0].0.get("w"), Some(ParamValue::Int(12)));
    assert!(!events.iter().any(|e| matches!(
        e,
        SessionEvent::Log { text, .. } if text.contains("re-scored")
    )));
}

#[test]
fn combinations_try_each_candidate_once() {
    let lab = lab(&[("echo.toml", &lag_manifest(11))], 0);
    let mut config = session("echo").with_mode(SearchMode::Combinations);
    config.generation = GenerationOptions {
        values_per_param: 3,
        max_combinations: 1000,
    };
    let events = lab.controller.start(config).unwrap().wait();

    let (reason, success) = finished(&events);
    assert_eq!(reason, FinishReason::Completed);
    assert!(success);

    let counts: Vec<(usize, usize)> = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Progress(Progress::Count { current, total }) => Some((*current, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(counts, vec![(1, 3), (2, 3), (3, 3)]);

    let updates = best_updates(&events);
    assert_strictly_increasing(&updates);
    assert_eq!(updates.last().unwrap().0.get("w"), Some(ParamValue::Int(12)));

    let names = files_in(&lab.config.optimize_dir.join("echo").join("success"));
    assert!(names.iter().all(|n| n.starts_with("combo_echo_top3_")), "{names:?}");
    assert!(
        !lab.config.optimize_dir.join("echo").join("optimization_state_echo.json").exists(),
        "combination sessions never write resume state"
    );
}

#[test]
fn failing_predictor_is_an_initial_test_error() {
    let lab = lab(&[("broken.toml", BROKEN)], 0);
    let events = lab.controller.start(session("broken")).unwrap().wait();

    let (reason, success) = finished(&events);
    assert_eq!(reason, FinishReason::InitialTestError);
    assert!(!success);
    assert!(best_updates(&events).is_empty());
    assert!(files_in(&lab.config.optimize_dir.join("broken").join("success")).is_empty());
    let state = lab.config.optimize_dir.join("broken").join("optimization_state_broken.json");
    assert!(!state.exists());
}

#[test]
fn pause_then_stop() {
    // Slow enough that one evaluation takes about a second
    let lab = lab(&[("echo.toml", &lag_manifest(10))], 20);
    let handle = lab.controller.start(session("echo")).unwrap();

    // Wait for the scored starting point
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut seen = Vec::new();
    while !matches!(seen.last(), Some(SessionEvent::BestUpdate { .. })) {
        let left = deadline.saturating_duration_since(Instant::now());
        seen.push(handle.events().recv_timeout(left).expect("starting point scored"));
    }

    assert!(handle.pause());
    assert_eq!(handle.state(), SessionState::Paused);
    // At most the event already in flight arrives after pausing
    std::thread::sleep(Duration::from_millis(200));
    let in_flight: Vec<_> = handle.events().try_iter().collect();
    assert!(in_flight.len() <= 1, "{in_flight:?}");
    std::thread::sleep(Duration::from_millis(300));
    assert!(handle.events().try_recv().is_err(), "paused worker kept going");

    handle.stop();
    let rest = handle.wait();
    let (reason, success) = finished(&rest);
    assert_eq!(reason, FinishReason::Stopped);
    assert!(success);

    let state = ArtifactManager::new(&lab.config.optimize_dir)
        .read_state("echo")
        .unwrap()
        .expect("best persisted on stop");
    assert_eq!(state.save_reason, "stopped");
    assert!(!lab.controller.is_active("echo"));
}

#[test]
fn stop_yields_one_final_event_and_frees_the_target() {
    let lab = lab(&[("echo.toml", &lag_manifest(10))], 20);
    let handle = lab.controller.start(session("echo")).unwrap();
    assert!(lab.controller.is_active("echo"));

    let err = lab.controller.start(session("echo")).unwrap_err();
    assert!(matches!(err, Error::SessionConflict(_)), "{err}");

    std::thread::sleep(Duration::from_millis(100));
    handle.stop();
    let events = handle.wait();
    let (reason, _) = finished(&events);
    assert_eq!(reason, FinishReason::Stopped);
    assert!(!lab.controller.is_active("echo"));
}

#[test]
fn time_budget_ends_the_session() {
    let lab = lab(&[("echo.toml", &lag_manifest(10))], 20);
    let mut config = session("echo");
    config.time_budget = Duration::from_millis(300);
    let events = lab.controller.start(config).unwrap().wait();
    let (reason, success) = finished(&events);
    assert_eq!(reason, FinishReason::TimeLimit);
    assert!(success);
}

fn seeded_metadata(target: &str, acc3: f64, second: u32) -> ArtifactMetadata {
    let score_tuple = ScoreTuple::new(acc3, 0.0, 0.0, 1.0);
    ArtifactMetadata {
        mode: SearchMode::HillClimb,
        target: target.to_string(),
        params: [("w", ParamValue::Int(10))].into_iter().collect(),
        performance: EvaluationResult {
            days_tested: 30,
            errors: 0,
            predict_failures: 0,
            hits: HitCounts::default(),
            acc1: 0.0,
            acc3,
            acc5: 0.0,
            acc10: 0.0,
            avg_top10_repetition: 1.0,
            max_top10_repetition: 1,
            most_common_top10: Vec::new(),
            score_tuple,
            duration: Duration::from_millis(1),
        },
        score_tuple,
        combination_algorithms: Vec::new(),
        range: range(),
        duration_seconds: 1.0,
        finish_reason: Some("completed".into()),
        timestamp: Local.with_ymd_and_hms(2023, 6, 1, 12, 0, second).unwrap(),
    }
}

#[test]
fn delete_inferior_leaves_only_the_new_best() {
    let lab = lab(&[("echo.toml", &lag_manifest(10))], 0);
    let manager = ArtifactManager::new(&lab.config.optimize_dir);
    let target = lab.controller.registry().descriptor("echo").unwrap().clone();
    for (i, acc3) in [10.0, 20.0, 30.0].into_iter().enumerate() {
        manager.write(&target, &seeded_metadata("echo", acc3, i as u32)).unwrap();
    }
    assert_eq!(files_in(&manager.success_dir("echo")).len(), 6);

    let mut config = session("echo");
    config.delete_inferior = true;
    let events = lab.controller.start(config).unwrap().wait();
    assert_eq!(finished(&events).0, FinishReason::NoImprovement);

    let names = files_in(&manager.success_dir("echo"));
    assert_eq!(names.len(), 2, "{names:?}");
    assert!(names.iter().all(|n| n.starts_with("opt_echo_top3_100.0_")), "{names:?}");

    // A second prune with the same best is a no-op
    let best = manager.list("echo").unwrap()[0].metadata.score_tuple;
    assert!(manager.prune("echo", &best).unwrap().is_empty());
}

#[test]
fn rewrite_keeps_the_literal_form() {
    let source = r#"[algorithm]
class = "Blend"

[config]
description = "x"

[config.parameters]
alpha = 0.5
beta = 3

[[signals]]
kind = "repeat"
weight = "alpha"
lookback = "beta"
"#;
    let params: ParamMap = [("alpha", ParamValue::Float(-0.75))].into_iter().collect();
    let out = rewrite_source(source, "Blend", &params, None).unwrap();
    assert!(out.contains("alpha = -0.75"), "{out}");
    assert!(out.contains("beta = 3\n"), "{out}");

    let extracted = extract_parameters(&out).unwrap();
    assert_eq!(
        extracted,
        vec![
            ("alpha".to_string(), ParamValue::Float(-0.75)),
            ("beta".to_string(), ParamValue::Int(3)),
        ]
    );
}

#[test]
fn tested_days_plus_errors_cover_days_with_a_next_draw() {
    let missing = [3, 7, 8, 15, 22];
    let lab = lab_with_store(&[("echo.toml", &lag_manifest(12))], 0, store(40, &missing));
    // Starts on the first stored day, which has no history
    let range = DateRange::new(day(0), day(30)).unwrap();
    let target = lab.controller.registry().descriptor("echo").unwrap();

    let present: BTreeSet<u64> = (0..40).filter(|i| !missing.contains(i)).collect();
    let expected = (0..=30).filter(|i| present.contains(&(i + 1))).count();

    let evaluator = lab.controller.evaluator("property");
    let result = evaluator
        .evaluate(target, &target.defaults(), &[], range, &Unchecked)
        .unwrap();
    assert_eq!(result.days_tested + result.errors, expected);
    assert!(result.errors >= 1, "day 0 has no history");

    // Idempotent
    let again = evaluator
        .evaluate(target, &target.defaults(), &[], range, &Unchecked)
        .unwrap();
    assert_eq!(again.score_tuple, result.score_tuple);
    assert!(files_in(evaluator.runner().scratch_dir()).is_empty(), "scratch cleaned up");
}

#[test]
fn partners_join_the_ranking() {
    let lab = lab(&[("echo.toml", &lag_manifest(12)), ("hot.toml", HOT)], 0);
    let target = lab.controller.registry().descriptor("echo").unwrap();
    let partners = lab.controller.partners("echo", &["hot".to_string()]).unwrap();
    assert_eq!(partners[0].weight, 1.0);

    let evaluator = lab.controller.evaluator("partners");
    let alone = evaluator
        .evaluate(target, &target.defaults(), &[], range(), &Unchecked)
        .unwrap();
    let together = evaluator
        .evaluate(target, &target.defaults(), &partners, range(), &Unchecked)
        .unwrap();
    assert_eq!(alone.days_tested, together.days_tested);
    assert_ne!(alone.most_common_top10, together.most_common_top10);

    assert!(lab.controller.partners("echo", &["echo".to_string()]).is_err());
    assert!(lab.controller.partners("echo", &["nope".to_string()]).is_err());
}

#[test]
fn invalid_sessions_are_rejected() {
    let lab = lab(&[("echo.toml", &lag_manifest(10))], 0);

    let mut past_the_end = session("echo");
    past_the_end.range = DateRange::new(day(20), day(59)).unwrap();
    assert!(matches!(
        lab.controller.start(past_the_end),
        Err(Error::InvalidConfig(_))
    ));

    let mut no_budget = session("echo");
    no_budget.time_budget = Duration::ZERO;
    assert!(matches!(lab.controller.start(no_budget), Err(Error::InvalidConfig(_))));

    let mut resumed_combo = session("echo").with_mode(SearchMode::Combinations);
    resumed_combo.resume_from = Some(ResumeFrom::Latest);
    assert!(matches!(
        lab.controller.start(resumed_combo),
        Err(Error::InvalidConfig(_))
    ));

    let mut bad_step = session("echo");
    bad_step.custom_steps.insert("w".into(), vec![0.0]);
    assert!(matches!(lab.controller.start(bad_step), Err(Error::InvalidConfig(_))));

    assert!(matches!(
        lab.controller.start(session("missing")),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn single_day_range_is_scored() {
    let lab = lab(&[("echo.toml", &lag_manifest(10))], 0);
    let one_day = DateRange::new(day(20), day(20)).unwrap();
    let target = lab.controller.registry().descriptor("echo").unwrap();

    let evaluator = lab.controller.evaluator("single");
    let result = evaluator
        .evaluate(target, &target.defaults(), &[], one_day, &Unchecked)
        .unwrap();
    assert_eq!(result.days_tested + result.errors, 1);

    let mut config = session("echo");
    config.range = one_day;
    let events = lab.controller.start(config).unwrap().wait();
    let (reason, success) = finished(&events);
    assert!(success);
    assert!(
        matches!(reason, FinishReason::Completed | FinishReason::NoImprovement),
        "{reason}"
    );
    assert!(!best_updates(&events).is_empty());
}

#[test]
fn look_alike_files_run_side_by_side() {
    let dashed = lag_manifest(10).replace("\"LagEcho\"", "\"DashedEcho\"");
    let lab = lab(&[("lag-echo.toml", &dashed), ("lag_echo.toml", &lag_manifest(10))], 0);
    let registry = lab.controller.registry();
    assert_eq!(
        registry.descriptor("lag-echo").unwrap().module_id,
        registry.descriptor("lag_echo").unwrap().module_id
    );

    let first = lab.controller.start(session("lag-echo")).unwrap();
    let second = lab.controller.start(session("lag_echo")).unwrap();
    let first_events = first.wait();
    let second_events = second.wait();
    assert!(finished(&first_events).1, "{first_events:?}");
    assert!(finished(&second_events).1, "{second_events:?}");

    let manager = ArtifactManager::new(&lab.config.optimize_dir);
    for (id, class) in [("lag-echo", "DashedEcho"), ("lag_echo", "LagEcho")] {
        let best = manager.list(id).unwrap();
        assert!(!best.is_empty(), "{id} saved nothing");
        assert_eq!(best[0].metadata.params.get("w"), Some(ParamValue::Int(12)));
        let source = fs::read_to_string(&best[0].paths.source).unwrap();
        assert!(source.contains(&format!("class = \"{class}\"")), "{id}: {source}");
    }
    assert!(files_in(&lab.config.scratch_dir).is_empty(), "scratch cleaned up");
}

#[test]
fn target_is_free_once_finished_arrives() {
    let lab = lab(&[("echo.toml", &lag_manifest(12))], 0);
    let handle = lab.controller.start(session("echo")).unwrap();

    let deadline = Instant::now() + Duration::from_secs(60);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = handle.events().recv_timeout(left).expect("session finishes");
        if event.is_finished() {
            break;
        }
    }
    assert!(!lab.controller.is_active("echo"));
    assert_eq!(handle.state(), SessionState::Terminated);

    let again = lab.controller.start(session("echo")).unwrap();
    assert!(finished(&again.wait()).1);
    handle.wait();
}

#[test]
fn negative_custom_steps_act_as_magnitudes() {
    let lab = lab(&[("echo.toml", &lag_manifest(11))], 0);
    let mut config = session("echo");
    config.custom_steps.insert("w".into(), vec![-1.0]);
    let events = lab.controller.start(config).unwrap().wait();

    let (_, success) = finished(&events);
    assert!(success);
    let updates = best_updates(&events);
    assert_eq!(updates.last().unwrap().0.get("w"), Some(ParamValue::Int(12)));
}
