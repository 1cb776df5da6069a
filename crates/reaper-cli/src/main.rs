use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use reaper_core::{
    ChannelEventSink, EnvKeyStore, ErrorLog, FanoutSink, Job, JobError, JobEvent, JobQueue,
    QueueConfig, SourceAdapter, SourceRef, TracingEventSink,
};
use reaper_sources::{HTTP_JSON_KIND, HttpJsonAdapter};

#[derive(Parser)]
#[command(name = "reaper", version, about = "Queue and run data-extraction jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one extraction job per source and print the records as JSON lines
    Run {
        /// Source to extract from, as NAME=URL (repeatable)
        #[arg(short, long = "source", value_name = "NAME=URL", value_parser = parse_source_arg)]
        sources: Vec<SourceArg>,

        /// JSON file holding an array of source definitions
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Number of jobs that may run at the same time
        #[arg(long, env = "REAPER_SLOTS", default_value_t = 1)]
        slots: usize,

        /// Pages to request from each --source
        #[arg(long, default_value_t = 1)]
        pages: u64,

        /// Response field (or JSON pointer) holding the record array
        #[arg(long)]
        records_field: Option<String>,

        /// Resolve an API key for each --source from REAPER_KEY_<NAME>
        #[arg(long, default_value_t = false)]
        keyed: bool,

        /// Send the API key in this header instead of as a bearer token
        #[arg(long, conflicts_with = "key_param")]
        key_header: Option<String>,

        /// Send the API key as this query parameter
        #[arg(long)]
        key_param: Option<String>,

        /// Request timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Allow sources on private or loopback addresses
        #[arg(long, default_value_t = false)]
        allow_private: bool,

        /// Write a per-job CSV summary to this path
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// List the source kinds this build can run
    Kinds,
}

/// A `--source NAME=URL` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceArg {
    name: String,
    url: String,
}

fn parse_source_arg(raw: &str) -> Result<SourceArg, String> {
    let (name, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=URL, got '{raw}'"))?;
    let (name, url) = (name.trim(), url.trim());
    if name.is_empty() {
        return Err("source name must not be empty".to_string());
    }
    if url.is_empty() {
        return Err(format!("source '{name}' has an empty URL"));
    }
    Ok(SourceArg {
        name: name.to_string(),
        url: url.to_string(),
    })
}

/// Options applied to every `--source` argument.
#[derive(Debug, Default)]
struct SourceOptions {
    pages: u64,
    records_field: Option<String>,
    keyed: bool,
    key_header: Option<String>,
    key_param: Option<String>,
}

impl SourceOptions {
    fn to_source(&self, arg: &SourceArg) -> SourceRef {
        let mut source = SourceRef::new(&arg.name, HTTP_JSON_KIND).with_param("url", &arg.url);
        if self.pages > 1 {
            source = source.with_param("pages", self.pages.to_string());
        }
        if let Some(field) = &self.records_field {
            source = source.with_param("records_field", field);
        }
        if let Some(header) = &self.key_header {
            source = source.with_param("key_header", header);
        }
        if let Some(param) = &self.key_param {
            source = source.with_param("key_param", param);
        }
        if self.keyed {
            source = source.with_key(&arg.name);
        }
        source
    }
}

/// Sources from `--file` first, then `--source` arguments, in order.
fn collect_sources(
    file: Option<&Path>,
    args: &[SourceArg],
    options: &SourceOptions,
) -> Result<Vec<SourceRef>> {
    let mut sources = match file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read sources file: {}", path.display()))?;
            serde_json::from_str::<Vec<SourceRef>>(&raw)
                .with_context(|| format!("Invalid sources file: {}", path.display()))?
        }
        None => Vec::new(),
    };
    sources.extend(args.iter().map(|arg| options.to_source(arg)));

    let mut seen = HashSet::new();
    for source in &sources {
        if !seen.insert(source.name.as_str()) {
            anyhow::bail!("Duplicate source name '{}'", source.name);
        }
    }
    Ok(sources)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reaper=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            sources,
            file,
            slots,
            pages,
            records_field,
            keyed,
            key_header,
            key_param,
            timeout,
            allow_private,
            summary,
        } => {
            let options = SourceOptions {
                pages,
                records_field,
                keyed,
                key_header,
                key_param,
            };
            let sources = collect_sources(file.as_deref(), &sources, &options)?;

            let http = HttpJsonAdapter::with_timeout(Duration::from_secs(timeout))
                .context("Failed to create HTTP client")?;
            let http = if allow_private {
                http.allow_private_urls()
            } else {
                http
            };

            cmd_run(
                sources,
                http,
                QueueConfig::default().with_slots(slots),
                summary.as_deref(),
            )
            .await?;
        }
        Commands::Kinds => {
            let registry = reaper_sources::default_registry()?;
            for kind in registry.kinds() {
                println!("{kind}");
            }
        }
    }

    Ok(())
}

async fn cmd_run(
    sources: Vec<SourceRef>,
    http: HttpJsonAdapter,
    config: QueueConfig,
    summary_path: Option<&Path>,
) -> Result<()> {
    if sources.is_empty() {
        anyhow::bail!("No sources given. Use --source NAME=URL or --file.");
    }

    let registry = reaper_sources::registry_with(http);
    if let Some(unknown) = sources.iter().find(|s| !registry.contains(&s.kind)) {
        anyhow::bail!(
            "Source '{}' has unknown kind '{}' (known: {})",
            unknown.name,
            unknown.kind,
            registry.kinds().collect::<Vec<_>>().join(", ")
        );
    }
    tracing::debug!(adapters = %registry.describe(), "Adapters ready");

    let errors = ErrorLog::new();
    let (channel, mut events) = ChannelEventSink::new();
    let sink = FanoutSink::new()
        .with(TracingEventSink)
        .with(errors.clone())
        .with(channel);

    let queue = JobQueue::new(registry, EnvKeyStore::new(), sink, config);
    for source in sources {
        queue.add(source);
    }

    tracing::info!(
        jobs = queue.len(),
        slots = queue.config().slots,
        "Starting run"
    );
    let wait = queue.run()?.wait();
    tokio::pin!(wait);

    let summary = loop {
        tokio::select! {
            summary = &mut wait => break summary?,
            Some(event) = events.recv() => print_records(&event),
            _ = tokio::signal::ctrl_c() => {
                let cancelled = queue.cancel_all();
                tracing::warn!(cancelled, "Interrupted, cancelling jobs");
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        print_records(&event);
    }

    if let Some(path) = summary_path {
        write_summary(path, &queue.jobs())?;
        tracing::info!(path = %path.display(), "Wrote run summary");
    }

    for entry in errors.entries() {
        tracing::debug!(job_id = %entry.job_id, detail = ?entry.detail, "Failure detail");
    }

    tracing::info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "Run finished"
    );

    if summary.failed > 0 {
        anyhow::bail!("{} of {} jobs failed", summary.failed, summary.total());
    }
    Ok(())
}

/// JSON lines for each record in an output event; other events yield nothing.
fn record_lines(event: &JobEvent) -> Vec<String> {
    match event {
        JobEvent::Output { source, output, .. } => output
            .records
            .iter()
            .map(|record| json!({ "source": source, "record": record }).to_string())
            .collect(),
        _ => Vec::new(),
    }
}

fn print_records(event: &JobEvent) {
    for line in record_lines(event) {
        println!("{line}");
    }
}

const SUMMARY_HEADER: [&str; 7] = [
    "source", "kind", "status", "progress", "error", "started_at", "finished_at",
];

/// Write one CSV row per job, in queue order.
fn write_summary(path: &Path, jobs: &[Job]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create summary file: {}", path.display()))?;
    writer.write_record(SUMMARY_HEADER)?;

    for job in jobs {
        writer.write_record([
            job.source().name.clone(),
            job.source().kind.clone(),
            job.status().to_string(),
            job.progress().to_string(),
            job.error().map(JobError::summary).unwrap_or_default(),
            rfc3339(job.started_at()),
            rfc3339(job.finished_at()),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn rfc3339(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339()).unwrap_or_default()
}
