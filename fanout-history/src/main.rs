use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use libfanout::db::RunQuery;
use libfanout::store::EventLogStore;
use libfanout::types::{PostEvent, PostRecord, RunState};
use libfanout::{Config, Database};

#[derive(Parser, Debug)]
#[command(name = "fanout-history")]
#[command(version, about = "Query local posting runs and their event logs")]
#[command(long_about = r#"Query local posting runs and their event logs.

EXAMPLES:
    # Show the last 20 runs (default)
    fanout-history

    # Runs of one submission
    fanout-history --submission 6f1c2a

    # Only failed runs since a date
    fanout-history --state failed --since "2026-10-01"

    # Every event of one run
    fanout-history --run 3b9e0c4d-...

    # Only the failures of one run, as JSON lines
    fanout-history --run 3b9e0c4d-... --failed-only --format jsonl

    # Scripting
    fanout-history --format json | jq '.[] | select(.state == "FAILED") | .id'

OUTPUT FORMATS:
    text  - Human-readable text (default)
    json  - JSON array
    jsonl - JSON lines, one object per line
    csv   - CSV with headers

EXIT CODES:
    0 - Success (including empty results)
    1 - Error (database not found, query failed, etc.)
"#)]
struct Args {
    /// Show the events of this run instead of listing runs
    #[arg(short, long, value_name = "RUN_ID")]
    run: Option<String>,

    /// With --run, only show failure events
    #[arg(long, requires = "run")]
    failed_only: bool,

    /// Only runs of this submission
    #[arg(short, long, value_name = "SUBMISSION_ID")]
    submission: Option<String>,

    /// Only runs in this state (pending, running, done, failed)
    #[arg(long, value_name = "STATE")]
    state: Option<String>,

    /// Runs created since this date (Unix seconds, YYYY-MM-DD, or RFC 3339)
    #[arg(long, value_name = "DATE")]
    since: Option<String>,

    /// Runs created until this date (Unix seconds, YYYY-MM-DD, or RFC 3339)
    #[arg(long, value_name = "DATE")]
    until: Option<String>,

    /// Maximum number of runs to return
    #[arg(short, long, default_value = "20", value_name = "N")]
    limit: usize,

    /// Output format
    #[arg(short, long, default_value = "text", value_name = "FORMAT")]
    #[arg(value_parser = ["text", "json", "jsonl", "csv"])]
    format: String,
}

/// One run as printed
#[derive(Debug, Serialize)]
struct RunEntry {
    id: String,
    submission_id: String,
    state: String,
    resume_mode: String,
    created_at: i64,
    completed_at: Option<i64>,
}

impl From<PostRecord> for RunEntry {
    fn from(run: PostRecord) -> Self {
        Self {
            id: run.id,
            submission_id: run.submission_id,
            state: run.state.to_string(),
            resume_mode: run.resume_mode.to_string(),
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }
}

/// Parse a date argument to Unix milliseconds
fn parse_date(date_str: &str) -> Result<i64> {
    if let Ok(seconds) = date_str.parse::<i64>() {
        return Ok(seconds * 1000);
    }

    let dt = chrono::DateTime::parse_from_rfc3339(date_str)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .or_else(|_| {
            chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d")
                .map(|d| d.and_time(chrono::NaiveTime::MIN).and_utc())
        })
        .context(format!(
            "Invalid date format: {}. Use Unix seconds, YYYY-MM-DD or RFC 3339",
            date_str
        ))?;

    Ok(dt.timestamp_millis())
}

fn parse_state(state: &str) -> Result<RunState> {
    RunState::parse(&state.to_uppercase()).with_context(|| {
        format!(
            "Invalid state: {}. Valid states: pending, running, done, failed",
            state
        )
    })
}

fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Quote a CSV field when it needs it
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_runs(runs: &[RunEntry], format: &str) -> Result<String> {
    let mut out = String::new();
    match format {
        "json" => out.push_str(&serde_json::to_string_pretty(runs)?),
        "jsonl" => {
            for run in runs {
                out.push_str(&serde_json::to_string(run)?);
                out.push('\n');
            }
        }
        "csv" => {
            out.push_str("run_id,submission_id,state,resume_mode,created_at,completed_at\n");
            for run in runs {
                out.push_str(&format!(
                    "{},{},{},{},{},{}\n",
                    csv_field(&run.id),
                    csv_field(&run.submission_id),
                    run.state,
                    run.resume_mode,
                    run.created_at,
                    run.completed_at.map(|t| t.to_string()).unwrap_or_default()
                ));
            }
        }
        _ => {
            for run in runs {
                let symbol = match run.state.as_str() {
                    "DONE" => "✓",
                    "FAILED" => "✗",
                    _ => "…",
                };
                out.push_str(&format!(
                    "{} {} | {} | submission {} | {}\n",
                    symbol,
                    format_timestamp(run.created_at),
                    run.id,
                    run.submission_id,
                    run.resume_mode
                ));
            }
        }
    }
    Ok(out)
}

fn describe_event(event: &PostEvent) -> String {
    let mut line = format!("{} {}", event.account_id, event.event_type);
    if let Some(file_id) = &event.file_id {
        line.push_str(&format!(" file={}", file_id));
    }
    if let Some(batch) = event.metadata.batch_index {
        line.push_str(&format!(" batch={}", batch));
    }
    if let Some(url) = &event.source_url {
        line.push_str(&format!(" {}", url));
    }
    if let Some(error) = &event.error {
        line.push_str(&format!(" [{}] {}", error.stage, error.message));
    }
    line
}

fn render_events(events: &[PostEvent], format: &str) -> Result<String> {
    let mut out = String::new();
    match format {
        "json" => out.push_str(&serde_json::to_string_pretty(events)?),
        "jsonl" => {
            for event in events {
                out.push_str(&serde_json::to_string(event)?);
                out.push('\n');
            }
        }
        "csv" => {
            out.push_str("created_at,account_id,event_type,file_id,source_url,stage,error\n");
            for event in events {
                let (stage, message) = event
                    .error
                    .as_ref()
                    .map(|e| (e.stage.as_str(), e.message.as_str()))
                    .unwrap_or(("", ""));
                out.push_str(&format!(
                    "{},{},{},{},{},{},{}\n",
                    event.created_at,
                    csv_field(&event.account_id),
                    event.event_type,
                    csv_field(event.file_id.as_deref().unwrap_or("")),
                    csv_field(event.source_url.as_deref().unwrap_or("")),
                    stage,
                    csv_field(message)
                ));
            }
        }
        _ => {
            for event in events {
                out.push_str(&format!(
                    "{} {}\n",
                    format_timestamp(event.created_at),
                    describe_event(event)
                ));
            }
        }
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    libfanout::logging::init_default();

    let args = Args::parse();
    tracing::debug!("fanout-history started with args: {:?}", args);

    let config = Config::load().context("Failed to load configuration")?;
    let db = Database::open_read_only(&config.database.path)
        .await
        .context("Failed to open database. Has anything been posted yet?")?;

    let output = match &args.run {
        Some(run_id) => {
            let events = if args.failed_only {
                db.get_failed_events(run_id).await
            } else {
                db.find_by_run(run_id).await
            }
            .context("Failed to query events")?;
            render_events(&events, &args.format)?
        }
        None => {
            let query = RunQuery {
                submission_id: args.submission.clone(),
                state: args.state.as_deref().map(parse_state).transpose()?,
                since: args.since.as_deref().map(parse_date).transpose()?,
                until: args.until.as_deref().map(parse_date).transpose()?,
                limit: args.limit,
            };
            let runs: Vec<RunEntry> = db
                .query_runs(&query)
                .await
                .context("Failed to query runs")?
                .into_iter()
                .map(RunEntry::from)
                .collect();
            render_runs(&runs, &args.format)?
        }
    };

    print!("{}", output);
    Ok(())
}
