//! Harvest session coordination.
//!
//! A [`HarvestSession`] owns the context and the date window of one run.
//! Before the first request it seeds `from_date` from the durable store
//! (the latest identifier datestamp for the service and set), then drives
//! the [`Harvester`] with a sink that applies the record callback and the
//! ingestion pipeline and persists the alias checkpoint after every page.
//!
//! ```text
//! config ─▶ HarvestContext ─▶ seed_window() ─▶ Harvester::run()
//!                                                   │ records
//!                                                   ▼
//!                                  RecordCallback ─▶ IngestPipeline ─▶ SQLite
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint;
use crate::config::Config;
use crate::db;
use crate::error::{HarvestError, OaiErrorCode, Result};
use crate::formats::{Disposition, RecordCallback, RecordParser};
use crate::ingest::{IngestOutcome, IngestPipeline};
use crate::models::{HarvestContext, HarvestWindow, RawRecord, Service};
use crate::protocol::{HarvestState, Harvester, RecordSink};
use crate::services::ensure_service;
use crate::transport::{HttpTransport, Transport};

/// Per-run overrides from the command line.
#[derive(Debug, Clone, Default)]
pub struct HarvestOptions {
    /// Ignore stored progress and harvest the whole window.
    pub full: bool,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Summary of one session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub target: String,
    pub alias: String,
    pub state: HarvestState,
    pub window: HarvestWindow,
    pub requests: usize,
    pub records_seen: usize,
    pub inserted: u64,
    pub existing: u64,
    /// Deleted records dropped because the target ignores deletions.
    pub deleted_ignored: u64,
    /// Deleted records passed through and stored as tombstones.
    pub tombstones: u64,
    /// Records whose header or metadata could not be parsed.
    pub skipped: u64,
    pub checkpoint: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    inserted: u64,
    existing: u64,
    deleted_ignored: u64,
    tombstones: u64,
    skipped: u64,
}

pub struct HarvestSession {
    pool: SqlitePool,
    ctx: HarvestContext,
    service: Service,
    window: HarvestWindow,
    callback: RecordCallback,
}

impl HarvestSession {
    /// Resolve the service row for the context and select the record parser
    /// from its metadata prefix.
    pub async fn new(pool: SqlitePool, ctx: HarvestContext, window: HarvestWindow) -> Result<Self> {
        let service = ensure_service(&pool, &ctx.name, &ctx.endpoint).await?;
        let callback = RecordCallback::for_context(&ctx);
        Ok(Self {
            pool,
            ctx,
            service,
            window,
            callback,
        })
    }

    /// Replace the parser picked from the metadata prefix.
    pub fn with_parser(mut self, parser: Box<dyn RecordParser>) -> Self {
        self.callback = RecordCallback::new(parser, self.ctx.ignore_deleted);
        self
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn window(&self) -> &HarvestWindow {
        &self.window
    }

    /// Seed `from_date` from stored identifiers when none was given.
    ///
    /// With `full` set the window is left as supplied.
    pub async fn seed_window(&mut self, full: bool) -> Result<()> {
        if full || self.window.from_date.is_some() {
            return Ok(());
        }
        let latest = checkpoint::latest_identifier_time(
            &self.pool,
            self.service.id,
            self.ctx.set_spec.as_deref(),
        )
        .await?;
        match latest {
            Some(ts) => info!(target = %self.ctx.name, from = %ts, "resuming from stored checkpoint"),
            None => info!(target = %self.ctx.name, "no stored checkpoint; full harvest"),
        }
        self.window.from_date = latest;
        Ok(())
    }

    /// Run the session to completion. The window is frozen from here on.
    pub async fn run<T>(
        self,
        transport: &T,
        shutdown: Option<&CancellationToken>,
    ) -> Result<SessionReport>
    where
        T: Transport + ?Sized,
    {
        let alias = self.ctx.alias();
        let pipeline =
            IngestPipeline::new(self.pool.clone(), self.service.id, self.ctx.set_spec.clone());
        let mut sink = IngestSink {
            callback: &self.callback,
            pipeline: &pipeline,
            pool: &self.pool,
            alias: &alias,
            counts: Counts::default(),
        };
        let mut harvester = Harvester::new(self.ctx.clone(), self.window.clone());

        let result = harvester.run(transport, &mut sink, shutdown).await;
        let counts = sink.counts;

        let report = SessionReport {
            target: self.ctx.name.clone(),
            alias: alias.clone(),
            state: harvester.state(),
            window: self.window.clone(),
            requests: harvester.requests_issued(),
            records_seen: harvester.records_seen(),
            inserted: counts.inserted,
            existing: counts.existing,
            deleted_ignored: counts.deleted_ignored,
            tombstones: counts.tombstones,
            skipped: counts.skipped + harvester.records_skipped() as u64,
            checkpoint: harvester.checkpoint(),
        };

        match result {
            Ok(state) => {
                info!(
                    target = %report.target,
                    state = state.as_str(),
                    requests = report.requests,
                    inserted = report.inserted,
                    existing = report.existing,
                    skipped = report.skipped,
                    "session finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    target = %report.target,
                    requests = report.requests,
                    inserted = report.inserted,
                    error = %e,
                    "session failed"
                );
                Err(e)
            }
        }
    }
}

/// Applies the record callback and ingests what survives it.
struct IngestSink<'a> {
    callback: &'a RecordCallback,
    pipeline: &'a IngestPipeline,
    pool: &'a SqlitePool,
    alias: &'a str,
    counts: Counts,
}

#[async_trait]
impl<'a> RecordSink for IngestSink<'a> {
    async fn accept(&mut self, record: RawRecord) -> Result<()> {
        let metadata = match self.callback.handle(&record) {
            Ok(Disposition::Live(metadata)) => Some(metadata),
            Ok(Disposition::Deleted) => None,
            Ok(Disposition::Dropped) => {
                self.counts.deleted_ignored += 1;
                return Ok(());
            }
            Err(e) => {
                warn!(
                    identifier = %record.header.identifier,
                    metadata_prefix = self.callback.metadata_prefix(),
                    error = %e,
                    "skipping record"
                );
                self.counts.skipped += 1;
                return Ok(());
            }
        };

        let outcome = self.pipeline.ingest_record(&record, metadata).await?;
        match outcome {
            IngestOutcome::Inserted if record.header.deleted => self.counts.tombstones += 1,
            IngestOutcome::Inserted => self.counts.inserted += 1,
            IngestOutcome::Existing => self.counts.existing += 1,
        }
        Ok(())
    }

    async fn page_complete(&mut self, checkpoint: Option<DateTime<Utc>>) -> Result<()> {
        if let Some(ts) = checkpoint {
            checkpoint::set_checkpoint(self.pool, self.alias, ts).await?;
        }
        Ok(())
    }
}

/// Build and run the session for one configured target.
pub async fn run_target(
    config: &Config,
    pool: &SqlitePool,
    name: &str,
    options: &HarvestOptions,
    shutdown: Option<&CancellationToken>,
) -> Result<SessionReport> {
    let target = config
        .targets
        .get(name)
        .ok_or_else(|| HarvestError::config(format!("unknown target: '{}'", name)))?;
    let ctx = target.context(name)?;

    let mut window = target.window()?;
    if options.from.is_some() {
        window.from_date = options.from;
    }
    if options.until.is_some() {
        window.until_date = options.until;
    }
    if let (Some(from), Some(until)) = (window.from_date, window.until_date) {
        if from > until {
            return Err(HarvestError::config(format!(
                "{}: from date {} is after until date {}",
                name, from, until
            )));
        }
    }

    let transport = HttpTransport::new(&config.http)?;
    let mut session = HarvestSession::new(pool.clone(), ctx, window).await?;
    session.seed_window(options.full).await?;
    session.run(&transport, shutdown).await
}

/// Run `names` concurrently on a shared pool, one session per target.
///
/// Results come back in completion order. A session task that dies is
/// reported as a failure of its target; the others run to completion.
pub async fn run_all(
    config: &Config,
    pool: &SqlitePool,
    names: Vec<String>,
    options: &HarvestOptions,
    shutdown: &CancellationToken,
) -> Vec<(String, Result<SessionReport>)> {
    let mut sessions = JoinSet::new();
    for name in names.iter().cloned() {
        let config = config.clone();
        let pool = pool.clone();
        let options = options.clone();
        let shutdown = shutdown.clone();
        sessions.spawn(async move {
            let result = run_target(&config, &pool, &name, &options, Some(&shutdown)).await;
            (name, result)
        });
    }

    drain_sessions(sessions, names).await
}

async fn drain_sessions(
    mut sessions: JoinSet<(String, Result<SessionReport>)>,
    names: Vec<String>,
) -> Vec<(String, Result<SessionReport>)> {
    let mut results = Vec::with_capacity(names.len());
    while let Some(joined) = sessions.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "session task died"),
        }
    }

    // A task that died took its name with it.
    for name in names {
        if !results.iter().any(|(done, _)| *done == name) {
            results.push((
                name,
                Err(HarvestError::Task("session task died before reporting".to_string())),
            ));
        }
    }
    results
}

/// CLI entry point for `harvest run <target|all>`.
pub async fn run_harvest(
    config: &Config,
    target: &str,
    options: HarvestOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let names: Vec<String> = if target == "all" {
        config.targets.keys().cloned().collect()
    } else if config.targets.contains_key(target) {
        vec![target.to_string()]
    } else {
        let available: Vec<&str> = config.targets.keys().map(String::as_str).collect();
        anyhow::bail!(
            "Unknown target: '{}'. Available: {}",
            target,
            if available.is_empty() {
                "(none configured)".to_string()
            } else {
                available.join(", ")
            }
        );
    };

    if names.is_empty() {
        anyhow::bail!("No targets configured");
    }

    let pool = db::connect(config).await?;
    let results = run_all(config, &pool, names, &options, &shutdown).await;
    pool.close().await;

    let mut failed = 0usize;
    for (name, result) in results {
        match result {
            Ok(report) => print_report(&report),
            Err(HarvestError::Protocol(ref err)) if err.code == OaiErrorCode::NoRecordsMatch => {
                println!("harvest {}", name);
                println!("  no new records");
                println!("ok");
            }
            Err(e) => {
                failed += 1;
                println!("harvest {}", name);
                println!("  failed: {}", e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} target(s) failed", failed);
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    let fmt = |ts: Option<DateTime<Utc>>| {
        ts.map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
            .unwrap_or_else(|| "-".to_string())
    };
    println!("harvest {}", report.target);
    println!("  from: {}", fmt(report.window.from_date));
    println!("  until: {}", fmt(report.window.until_date));
    println!("  requests: {}", report.requests);
    println!("  records seen: {}", report.records_seen);
    println!("  inserted: {}", report.inserted);
    println!("  existing: {}", report.existing);
    println!("  deleted ignored: {}", report.deleted_ignored);
    println!("  tombstones: {}", report.tombstones);
    println!("  skipped: {}", report.skipped);
    println!("  checkpoint: {}", fmt(report.checkpoint));
    println!("  state: {}", report.state.as_str());
    if report.state.is_terminal() {
        println!("ok");
    }
}
