//! # Stage: Administrative CLI
//!
//! ## Responsibility
//! Argument parsing and one handler per subcommand. Every handler is a thin
//! wrapper over a registry, ledger, gateway or stats call, rendering the
//! result to the supplied writer.
//!
//! ## NOT Responsible For
//! - Business rules (validation lives in `model`, transitions in `store`)
//! - Tracing setup (the binary owns the subscriber)

use std::io::{BufRead, Write};
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use colored::*;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::LabError;
use crate::ingest::{Gateway, IngestOutcome};
use crate::model::{Event, Experiment, NewExperiment, Targeting};
use crate::stats::{self, Analysis, Verdict};
use crate::store::{EventLedger, ExperimentRegistry, SqliteStore};

pub const BIN_NAME: &str = "headline-lab";

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = BIN_NAME)]
#[command(version)]
#[command(about = "Headline A/B experiments: record views and conversions, call winners")]
pub struct Args {
    /// TOML config file
    #[arg(long, global = true, env = "HLAB_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database path (overrides config and HLAB_DB_PATH)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Declare an experiment explicitly (server provenance)
    Create {
        name: String,

        /// Comma-separated variant labels, control first
        #[arg(long, value_delimiter = ',', required = true)]
        variants: Vec<String>,

        /// Comma-separated traffic weights, one per variant, summing to 1
        #[arg(long, value_delimiter = ',')]
        weights: Option<Vec<f64>>,

        /// Free-text conversion goal
        #[arg(long)]
        goal: Option<String>,

        /// Page URL the experiment runs on
        #[arg(long)]
        url: Option<String>,

        /// CSS selector of the headline element
        #[arg(long)]
        target: Option<String>,

        /// CSS selector whose click counts as a conversion
        #[arg(long, conflicts_with = "conversion_url")]
        cta_target: Option<String>,

        /// URL whose visit counts as a conversion
        #[arg(long)]
        conversion_url: Option<String>,
    },

    /// List experiments, newest first
    List,

    /// Definition plus per-variant results
    Show {
        name: String,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Declare a winner and complete the experiment
    Winner {
        name: String,

        /// Winning variant index
        #[arg(long, short = 'v', allow_negative_numbers = true)]
        variant: i64,
    },

    /// Dump raw events
    Export {
        name: String,

        #[arg(long, short = 'f', value_enum, default_value = "csv")]
        format: ExportFormat,
    },

    /// Delete an experiment and all of its events
    Delete { name: String },

    /// Ingest beacon reports: one JSON object per stdin line, or --payload
    Ingest {
        #[arg(long)]
        payload: Option<String>,
    },

    /// Running experiments targeted at a page URL, as JSON
    Lookup {
        #[arg(long)]
        url: String,
    },

    /// Read or write a stored key/value setting
    Setting {
        #[command(subcommand)]
        action: SettingAction,
    },

    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum SettingAction {
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Lab(#[from] LabError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Usage(String),
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Execute `command`. `input` feeds `ingest` when no `--payload` is given.
pub fn run(
    command: Command,
    config: &Config,
    input: impl BufRead,
    out: &mut impl Write,
) -> Result<(), CliError> {
    if let Command::Completions { shell } = command {
        clap_complete::generate(shell, &mut Args::command(), BIN_NAME, out);
        return Ok(());
    }

    let store = SqliteStore::open(&config.db_path, &config.store_options())?;
    debug!(db = ?store.path(), "store ready");

    match command {
        Command::Create {
            name,
            variants,
            weights,
            goal,
            url,
            target,
            cta_target,
            conversion_url,
        } => {
            let targeting = Targeting { url, target, cta_target, conversion_url }.normalized();
            if targeting.cta_target.is_some() && targeting.conversion_url.is_some() {
                return Err(CliError::Usage(
                    "--cta-target and --conversion-url are mutually exclusive".into(),
                ));
            }
            let def = NewExperiment { name, variants, weights, goal };
            let exp = store.create(&def)?;
            if !targeting.is_empty() {
                store.set_targeting(&exp.name, &targeting)?;
            }
            writeln!(
                out,
                "{} {} ({} variants)",
                "Created".green().bold(),
                exp.name.bold(),
                exp.variant_count()
            )?;
        }
        Command::List => list(&store, out)?,
        Command::Show { name, json } => show(&store, &name, json, out)?,
        Command::Winner { name, variant } => {
            let exp = store.set_winner(&name, variant)?;
            let label = exp
                .winner
                .and_then(|w| exp.variants.get(w))
                .map(String::as_str)
                .unwrap_or_default();
            writeln!(
                out,
                "{} {} won \"{}\" (variant {})",
                "Completed".green().bold(),
                exp.name.bold(),
                label,
                variant
            )?;
        }
        Command::Export { name, format } => {
            store.get(&name)?;
            let events = store.events(&name)?;
            match format {
                ExportFormat::Csv => export_csv(&events, out)?,
                ExportFormat::Json => export_json(&events, out)?,
            }
        }
        Command::Delete { name } => {
            store.delete(&name)?;
            writeln!(out, "{} {}", "Deleted".red().bold(), name)?;
        }
        Command::Ingest { payload } => ingest(&store, payload, input, out)?,
        Command::Lookup { url } => {
            let entries = Gateway::new(&store).lookup(&url)?;
            writeln!(out, "{}", serde_json::to_string_pretty(&entries)?)?;
        }
        Command::Setting { action } => match action {
            SettingAction::Get { key } => match store.get_setting(&key)? {
                Some(value) => writeln!(out, "{value}")?,
                None => return Err(CliError::Usage(format!("setting '{key}' is not set"))),
            },
            SettingAction::Set { key, value } => {
                store.set_setting(&key, &value)?;
                writeln!(out, "{key} = {value}")?;
            }
        },
        Command::Completions { .. } => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn list(store: &SqliteStore, out: &mut impl Write) -> Result<(), CliError> {
    let experiments = store.list()?;
    if experiments.is_empty() {
        writeln!(out, "No experiments yet.")?;
        return Ok(());
    }

    writeln!(
        out,
        "{:<24}  {:<12}  {:<10}  {:>8}  {:>8}  {:>11}  CREATED",
        "NAME", "SOURCE", "STATE", "VARIANTS", "VIEWS", "CONVERSIONS"
    )?;
    for exp in &experiments {
        let (views, conversions) = store
            .aggregate(&exp.name)?
            .iter()
            .fold((0u64, 0u64), |(v, c), s| (v + s.views, c + s.conversions));

        let mut source = exp.provenance.to_string();
        if exp.has_conflict {
            source.push_str(" (!)");
        }
        let state = exp.state.as_str().to_uppercase();
        let state = if exp.is_running() { state.green() } else { state.dimmed() };

        writeln!(
            out,
            "{:<24}  {:<12}  {:<10}  {:>8}  {:>8}  {:>11}  {}",
            exp.name,
            source,
            state,
            exp.variant_count(),
            group_thousands(views),
            group_thousands(conversions),
            format_date(exp.created_at)
        )?;
    }
    Ok(())
}

#[derive(Serialize)]
struct ShowReport<'a> {
    experiment: &'a Experiment,
    analysis: &'a Analysis,
    verdict: Verdict,
}

fn show(store: &SqliteStore, name: &str, json: bool, out: &mut impl Write) -> Result<(), CliError> {
    let exp = store.get(name)?;
    let analysis = stats::analyze(&exp, &store.aggregate(name)?);

    if json {
        let report = ShowReport { experiment: &exp, analysis: &analysis, verdict: analysis.verdict() };
        writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        return Ok(());
    }

    writeln!(out, "{} {}", "EXPERIMENT:".bold(), exp.name)?;
    writeln!(out, "{} {}", "STATE:".bold(), exp.state)?;
    let mut source = exp.provenance.to_string();
    if exp.has_conflict {
        source.push_str(&format!(" {}", "(conflicting reports seen)".yellow()));
    }
    writeln!(out, "{} {}", "SOURCE:".bold(), source)?;
    if let Some(goal) = &exp.goal {
        writeln!(out, "{} {}", "GOAL:".bold(), goal)?;
    }
    if let Some(url) = &exp.targeting.url {
        writeln!(out, "{} {}", "URL:".bold(), url)?;
    }
    if let Some(w) = exp.winner.and_then(|w| exp.variants.get(w)) {
        writeln!(out, "{} {}", "WINNER:".bold(), w.green())?;
    }
    writeln!(out, "{} {}", "CREATED:".bold(), format_date(exp.created_at))?;
    writeln!(out)?;

    writeln!(
        out,
        "{:<16}  {:>7}  {:>11}  {:>7}  95% CI",
        "VARIANT", "VIEWS", "CONVERSIONS", "RATE"
    )?;
    writeln!(out, "{}", "─".repeat(64))?;
    for v in &analysis.variants {
        let ci = if v.views == 0 {
            "N/A".to_string()
        } else {
            format!("[{:.1}%, {:.1}%]", v.ci_lower * 100.0, v.ci_upper * 100.0)
        };
        let marker = if v.index == analysis.leading_variant && analysis.variants.len() > 1 {
            format!(" {}", "<- LEADING".cyan())
        } else {
            String::new()
        };
        writeln!(
            out,
            "{:<16}  {:>7}  {:>11}  {:>7}  {}{}",
            truncate_label(&v.label),
            v.views,
            v.conversions,
            format_percent(v.rate),
            ci,
            marker
        )?;
    }
    writeln!(out)?;

    if let Some(leader) = analysis.leader().filter(|_| analysis.variants.len() > 1) {
        let pct = analysis.confidence * 100.0;
        match analysis.verdict() {
            Verdict::Significant => writeln!(
                out,
                "{} {:.1}% confident \"{}\" is the winner",
                "Significant:".green().bold(),
                pct,
                leader.label
            )?,
            Verdict::Trending => writeln!(
                out,
                "{} {:.1}% confident \"{}\" leads (not yet significant)",
                "Trending:".yellow().bold(),
                pct,
                leader.label
            )?,
            Verdict::InsufficientData => {
                writeln!(out, "{} not enough data to call a winner", "Inconclusive:".dimmed())?
            }
        }
    }
    Ok(())
}

/// One exported event row. Shared by the CSV and JSON exports.
#[derive(Debug, Serialize)]
struct ExportRow<'a> {
    timestamp: i64,
    variant: usize,
    event_type: &'a str,
    visitor_id: &'a str,
}

impl<'a> From<&'a Event> for ExportRow<'a> {
    fn from(e: &'a Event) -> Self {
        Self {
            timestamp: e.created_at,
            variant: e.variant,
            event_type: e.kind.as_str(),
            visitor_id: &e.visitor_id,
        }
    }
}

fn export_csv(events: &[Event], out: &mut impl Write) -> Result<(), CliError> {
    let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(out);
    w.write_record(["timestamp", "variant", "event_type", "visitor_id"])?;
    for e in events {
        w.serialize(ExportRow::from(e))?;
    }
    w.flush()?;
    Ok(())
}

fn export_json(events: &[Event], out: &mut impl Write) -> Result<(), CliError> {
    #[derive(Serialize)]
    struct Export<'a> {
        events: Vec<ExportRow<'a>>,
    }
    let doc = Export { events: events.iter().map(ExportRow::from).collect() };
    writeln!(out, "{}", serde_json::to_string_pretty(&doc)?)?;
    Ok(())
}

fn ingest(
    store: &SqliteStore,
    payload: Option<String>,
    input: impl BufRead,
    out: &mut impl Write,
) -> Result<(), CliError> {
    let gateway = Gateway::new(store);

    if let Some(raw) = payload {
        let outcome = gateway.ingest_json(&raw)?;
        writeln!(out, "{}", describe(&outcome))?;
        return Ok(());
    }

    let (mut recorded, mut duplicates, mut rejected) = (0u64, 0u64, 0u64);
    for (n, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match gateway.ingest_json(&line) {
            Ok(o) if o.recorded => recorded += 1,
            Ok(_) => duplicates += 1,
            Err(e) if e.kind().is_client_error() => {
                warn!(line = n + 1, kind = %e.kind(), "report rejected: {e}");
                rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    writeln!(
        out,
        "{} recorded, {} duplicate, {} rejected",
        recorded.to_string().green(),
        duplicates,
        if rejected > 0 { rejected.to_string().red() } else { rejected.to_string().normal() }
    )?;
    Ok(())
}

fn describe(outcome: &IngestOutcome) -> String {
    let mut s = if outcome.recorded { "recorded" } else { "duplicate" }.to_string();
    if outcome.created {
        s.push_str(", experiment created");
    }
    if outcome.conflict_flagged {
        s.push_str(", provenance conflict flagged");
    }
    s
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn format_date(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "-".into())
}

fn format_percent(rate: f64) -> String {
    if rate == 0.0 {
        "0%".into()
    } else {
        format!("{:.2}%", rate * 100.0)
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn truncate_label(label: &str) -> String {
    if label.chars().count() > 16 {
        let head: String = label.chars().take(13).collect();
        format!("{head}...")
    } else {
        label.to_string()
    }
}
