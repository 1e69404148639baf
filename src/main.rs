//! lotopt CLI - tune lottery prediction algorithms against history
//!
//! Subcommands map onto the library's layers:
//!
//! 1. `list`: scan the algorithms directory and show what loaded
//! 2. `evaluate`: replay one algorithm (plus partners) over a date range
//! 3. `optimize`: run a search session and stream its events
//! 4. `artifacts`: show saved winners, optionally pruning the inferior ones
//!
//! Configuration comes from lotopt.toml / pyproject.toml; flags override it.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use owo_colors::{OwoColorize, Style};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lotopt::controller::LogLevel;
use lotopt::evaluation::Unchecked;
use lotopt::search::Progress;
use lotopt::{
    Config, Controller, DateRange, EvaluationResult, GenerationOptions, ParamMap, ParamValue,
    Registry, ResultStore, ResumeFrom, SearchMode, SessionConfig, SessionEvent,
};

/// Tune lottery prediction algorithms against historical results
///
/// Examples:
///   lotopt list
///   lotopt evaluate hot_cold --start 2024-01-01 --end 2024-03-31
///   lotopt optimize hot_cold --start 2024-01-01 --end 2024-03-31 --budget 600
///   lotopt artifacts hot_cold --prune
#[derive(Parser, Debug)]
#[command(name = "lotopt")]
#[command(version)]
#[command(about, long_about = None)]
struct Cli {
    /// Directory to search (upwards) for lotopt.toml or pyproject.toml
    #[arg(short, long, default_value = ".", global = true)]
    root: PathBuf,

    /// Historical results file (overrides config)
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    /// Algorithms directory (overrides config)
    #[arg(long, global = true)]
    algorithms: Option<PathBuf>,

    /// Output directory for artifacts and resume state (overrides config)
    #[arg(long, global = true)]
    optimize_dir: Option<PathBuf>,

    /// Sleep at each suspension point, in milliseconds (overrides config)
    #[arg(long, global = true)]
    throttle_ms: Option<u64>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List algorithms alphabetically, with load failures
    List,

    /// Evaluate one algorithm once and print the result
    Evaluate {
        algorithm: String,

        #[arg(long, value_parser = parse_date)]
        start: NaiveDate,

        #[arg(long, value_parser = parse_date)]
        end: NaiveDate,

        /// Partner algorithm evaluated alongside (repeatable)
        #[arg(long = "partner", value_name = "ID")]
        partners: Vec<String>,

        /// Parameter override NAME=VALUE (repeatable)
        #[arg(long = "set", value_name = "NAME=VALUE")]
        overrides: Vec<String>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run an optimization session
    Optimize {
        algorithm: String,

        #[arg(long, value_parser = parse_date)]
        start: NaiveDate,

        #[arg(long, value_parser = parse_date)]
        end: NaiveDate,

        /// Time budget in seconds
        #[arg(long, default_value = "600")]
        budget: f64,

        #[arg(long, value_enum, default_value_t = ModeArg::HillClimb)]
        mode: ModeArg,

        /// Explicit steps NAME=S1,S2 for hill-climb (repeatable)
        #[arg(long = "step", value_name = "NAME=STEPS")]
        steps: Vec<String>,

        /// Values generated per parameter in combinations mode
        #[arg(long, default_value = "3")]
        values_per_param: usize,

        /// Combination cap (defaults to the configured one)
        #[arg(long)]
        max_combinations: Option<usize>,

        /// Partner algorithm evaluated alongside (repeatable)
        #[arg(long = "partner", value_name = "ID")]
        partners: Vec<String>,

        /// Delete strictly worse artifacts after each improvement
        #[arg(long)]
        delete_inferior: bool,

        /// Resume hill-climb from `latest` or an artifact/state file
        #[arg(long, value_name = "latest|PATH")]
        resume: Option<ResumeFrom>,
    },

    /// List saved artifacts best-first
    Artifacts {
        algorithm: String,

        /// Delete every artifact worse than the best
        #[arg(long)]
        prune: bool,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    HillClimb,
    Combinations,
}

impl From<ModeArg> for SearchMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::HillClimb => SearchMode::HillClimb,
            ModeArg::Combinations => SearchMode::Combinations,
        }
    }
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("{s}: {e}"))
}

fn parse_number(s: &str) -> Result<ParamValue> {
    let s = s.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Ok(ParamValue::Int(v));
    }
    let v: f64 = s.parse().with_context(|| format!("not a number: {s:?}"))?;
    Ok(ParamValue::Float(v))
}

fn split_assignment(s: &str) -> Result<(&str, &str)> {
    s.split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| anyhow!("expected NAME=VALUE, got {s:?}"))
}

fn parse_steps(specs: &[String]) -> Result<BTreeMap<String, Vec<f64>>> {
    let mut steps = BTreeMap::new();
    for spec in specs {
        let (name, list) = split_assignment(spec)?;
        let values = list
            .split(',')
            .map(|v| v.trim().parse::<f64>().with_context(|| format!("bad step {v:?} for {name}")))
            .collect::<Result<Vec<_>>>()?;
        steps.insert(name.to_string(), values);
    }
    Ok(steps)
}

/// `text` styled, or plain when color is off.
fn paint(use_color: bool, text: impl Display, style: Style) -> String {
    if use_color {
        text.style(style).to_string()
    } else {
        text.to_string()
    }
}

fn init_logging(verbose: bool, use_color: bool) {
    let default = if verbose { "lotopt=debug" } else { "lotopt=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(use_color),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("failed to resolve root path '{}'", cli.root.display()))?;
    let mut config = Config::load(&root);
    if let Some(data) = &cli.data {
        config.data_file = data.clone();
    }
    if let Some(dir) = &cli.algorithms {
        config.algorithms_dir = dir.clone();
    }
    if let Some(dir) = &cli.optimize_dir {
        config.optimize_dir = dir.clone();
    }
    if let Some(ms) = cli.throttle_ms {
        config.throttle_ms = ms;
    }
    if cli.verbose {
        eprintln!("{}", config.display_summary());
    }
    Ok(config)
}

fn load_registry(config: &Config) -> Result<Registry> {
    let mut registry = Registry::from_config(config);
    let report = registry
        .scan()
        .with_context(|| format!("cannot scan {}", config.algorithms_dir.display()))?;
    for (path, message) in &report.failures {
        eprintln!("  {} {}: {message}", "skipped".yellow(), path.display());
    }
    Ok(registry)
}

fn load_store(config: &Config) -> Result<ResultStore> {
    ResultStore::load(&config.data_file)
        .with_context(|| format!("cannot load results from {}", config.data_file.display()))
}

fn date_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange> {
    DateRange::new(start, end).ok_or_else(|| anyhow!("--start {start} is after --end {end}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let use_color = !cli.no_color;
    init_logging(cli.verbose, use_color);

    match run(&cli, use_color) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("{} {e:#}", paint(use_color, "error:", Style::new().red().bold()));
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
fn run(cli: &Cli, use_color: bool) -> Result<bool> {
    let config = load_config(cli)?;
    match &cli.command {
        Command::List => {
            let registry = load_registry(&config)?;
            list(&registry, use_color);
            Ok(true)
        }
        Command::Evaluate {
            algorithm,
            start,
            end,
            partners,
            overrides,
            json,
        } => {
            let range = date_range(*start, *end)?;
            evaluate(&config, algorithm, range, partners, overrides, *json, use_color)?;
            Ok(true)
        }
        Command::Optimize {
            algorithm,
            start,
            end,
            budget,
            mode,
            steps,
            values_per_param,
            max_combinations,
            partners,
            delete_inferior,
            resume,
        } => {
            if !(budget.is_finite() && *budget > 0.0) {
                bail!("--budget must be a positive number of seconds");
            }
            let mut session = SessionConfig::new(
                algorithm.clone(),
                date_range(*start, *end)?,
                Duration::from_secs_f64(*budget),
            )
            .with_mode((*mode).into());
            session.custom_steps = parse_steps(steps)?;
            session.generation = GenerationOptions {
                values_per_param: *values_per_param,
                max_combinations: max_combinations.unwrap_or(config.default_max_combinations),
            };
            session.partners = partners.clone();
            session.delete_inferior = *delete_inferior;
            session.resume_from = resume.clone();
            optimize(config, session, use_color)
        }
        Command::Artifacts { algorithm, prune } => {
            artifacts(&config, algorithm, *prune, use_color)?;
            Ok(true)
        }
    }
}

fn list(registry: &Registry, use_color: bool) {
    if registry.is_empty() {
        println!("No algorithms found in {}", registry.dir().display());
        return;
    }
    for algo in registry.list() {
        let params: ParamMap = algo.defaults();
        println!(
            "{}  {}",
            paint(use_color, &algo.id, Style::new().bold()),
            paint(use_color, &algo.display_name, Style::new().dimmed())
        );
        if !algo.description.is_empty() {
            println!("    {}", algo.description);
        }
        if !algo.header.is_empty() {
            println!(
                "    id {}  version {}  date {}",
                algo.header.id.as_deref().unwrap_or("-"),
                algo.header.version.as_deref().unwrap_or("-"),
                algo.header
                    .date
                    .map(|d| d.format("%d/%m/%Y").to_string())
                    .unwrap_or_else(|| "-".into()),
            );
        }
        println!("    {}", paint(use_color, params, Style::new().cyan()));
    }
}

fn evaluate(
    config: &Config,
    algorithm: &str,
    range: DateRange,
    partner_ids: &[String],
    overrides: &[String],
    json: bool,
    use_color: bool,
) -> Result<()> {
    let store = Arc::new(load_store(config)?);
    let registry = Arc::new(load_registry(config)?);
    let controller = Controller::new(config.clone(), store, Arc::clone(&registry));

    let target = registry
        .descriptor(algorithm)
        .ok_or_else(|| anyhow!("unknown algorithm `{algorithm}`"))?;
    let mut params = target.defaults();
    for spec in overrides {
        let (name, value) = split_assignment(spec)?;
        let kind = target
            .kind_of(name)
            .ok_or_else(|| anyhow!("`{name}` is not a parameter of `{algorithm}`"))?;
        let value = parse_number(value)?
            .coerce(kind)
            .ok_or_else(|| anyhow!("{spec}: `{name}` is an integer parameter"))?;
        params.insert(name, value);
    }
    let partners = controller.partners(&target.id, partner_ids)?;

    let evaluator = controller.evaluator(&format!("{}_eval", target.id));
    let result = evaluator
        .evaluate(target, &params, &partners, range, &Unchecked)
        .with_context(|| format!("evaluating `{algorithm}` over {range}"))?;
    // The evaluator's scratch files are already gone; drop the directory too
    let _ = std::fs::remove_dir(evaluator.runner().scratch_dir());

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(algorithm, &params, &result, use_color);
    }
    Ok(())
}

fn print_result(algorithm: &str, params: &ParamMap, r: &EvaluationResult, use_color: bool) {
    println!("{} {}", paint(use_color, algorithm, Style::new().bold()), params);
    println!(
        "  days {}  errors {}  predict failures {}",
        r.days_tested, r.errors, r.predict_failures
    );
    println!(
        "  top1 {:.2}%  top3 {}  top5 {:.2}%  top10 {:.2}%",
        r.acc1,
        paint(use_color, format!("{:.2}%", r.acc3), Style::new().green().bold()),
        r.acc5,
        r.acc10
    );
    let common: Vec<String> = r
        .most_common_top10
        .iter()
        .map(|(code, n)| format!("{code}×{n}"))
        .collect();
    println!(
        "  repetition avg {:.3}  max {}  most common {}",
        r.avg_top10_repetition,
        r.max_top10_repetition,
        common.join(" ")
    );
    println!("  score {}  ({:.2?})", r.score_tuple, r.duration);
}

fn optimize(config: Config, session: SessionConfig, use_color: bool) -> Result<bool> {
    let store = Arc::new(load_store(&config)?);
    let registry = Arc::new(load_registry(&config)?);
    let controller = Controller::new(config, store, registry);

    let target = session.target.clone();
    let handle = controller
        .start(session)
        .with_context(|| format!("cannot start a session for `{target}`"))?;

    let mut success = false;
    while let Ok(event) = handle.events().recv() {
        if let SessionEvent::Finished { success: ok, .. } = &event {
            success = *ok;
        }
        let done = event.is_finished();
        print_event(&event, use_color);
        if done {
            break;
        }
    }
    handle.wait();
    Ok(success)
}

fn print_event(event: &SessionEvent, use_color: bool) {
    let dim = Style::new().dimmed();
    match event {
        // Already on stderr through the tracing mirror
        SessionEvent::Log { level, text, .. } => {
            if *level == LogLevel::Error {
                eprintln!("{} {text}", paint(use_color, "✗", Style::new().red()));
            }
        }
        SessionEvent::Status { text } => {
            println!("{} {text}", paint(use_color, "▶", Style::new().blue()));
        }
        SessionEvent::Progress(Progress::Count { current, total }) => {
            println!("  {} {current}/{total}", paint(use_color, "progress", dim));
        }
        SessionEvent::Progress(Progress::Fraction(f)) => {
            println!("  {} {:.0}% of budget", paint(use_color, "progress", dim), f * 100.0);
        }
        SessionEvent::BestUpdate {
            params,
            score_tuple,
        } => println!(
            "{} {params} {score_tuple}",
            paint(use_color, "★ best", Style::new().green().bold())
        ),
        SessionEvent::Finished {
            message,
            success,
            reason,
        } => {
            let style = if *success {
                Style::new().green().bold()
            } else {
                Style::new().red().bold()
            };
            println!("{} {message}", paint(use_color, format!("finished ({reason})"), style));
        }
        SessionEvent::Error { text } => {
            eprintln!("{} {text}", paint(use_color, "error:", Style::new().red().bold()));
        }
    }
}

fn artifacts(config: &Config, algorithm: &str, prune: bool, use_color: bool) -> Result<()> {
    let manager = lotopt::ArtifactManager::new(&config.optimize_dir);
    let entries = manager
        .list(algorithm)
        .with_context(|| format!("cannot list artifacts of `{algorithm}`"))?;
    if entries.is_empty() {
        println!("No artifacts for `{algorithm}` in {}", manager.success_dir(algorithm).display());
        return Ok(());
    }
    for (rank, entry) in entries.iter().enumerate() {
        let meta = &entry.metadata;
        let name = entry
            .paths
            .metadata
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!(
            "{:>3}. {}  {}  {}  {}",
            rank + 1,
            paint(use_color, name, Style::new().bold()),
            meta.score_tuple,
            paint(use_color, &meta.params, Style::new().cyan()),
            paint(use_color, meta.finish_reason.as_deref().unwrap_or("-"), Style::new().dimmed())
        );
    }
    if prune {
        let best = entries[0].metadata.score_tuple;
        let deleted = manager.prune(algorithm, &best)?;
        println!("Deleted {} files", deleted.len());
    }
    Ok(())
}
