//! Batch orchestration: leads → resolver → enricher → ledger → sink.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use mineassembler_shared::{AppConfig, AssemblyError, BatchMetrics, Project, ProjectLead};
use mineassembler_storage::ProjectSink;

use crate::enrichment::GeocodingEnricher;
use crate::ledger::Ledger;
use crate::resolver::{Resolution, Resolver};

// ---------------------------------------------------------------------------
// Settings, progress, summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub batch_size: usize,
    /// Identifiers resolved at once within a batch.
    pub concurrency: usize,
    /// Pause between two batches.
    pub pause: Duration,
}

impl From<&AppConfig> for OrchestratorSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            batch_size: config.batch.size.max(1),
            concurrency: config.batch.api_concurrency.max(1),
            pause: Duration::from_millis(config.batch.pause_ms),
        }
    }
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called once before the first batch.
    fn started(&self, total_leads: usize, batches: usize);
    /// Called whenever an identifier reaches a terminal state.
    fn identifier_done(&self, id: &str, succeeded: bool);
    /// Called after a batch has been flushed.
    fn batch_done(&self, metrics: &BatchMetrics);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn started(&self, _total_leads: usize, _batches: usize) {}
    fn identifier_done(&self, _id: &str, _succeeded: bool) {}
    fn batch_done(&self, _metrics: &BatchMetrics) {}
}

/// Totals for a whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub batches: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub abandoned: usize,
    pub failed_by_reason: BTreeMap<String, usize>,
    pub elapsed_ms: u64,
    /// Shutdown was requested before every lead was started.
    pub interrupted: bool,
    /// Process-level error that stopped the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl RunSummary {
    fn absorb(&mut self, metrics: &BatchMetrics) {
        self.batches += 1;
        self.attempted += metrics.attempted;
        self.succeeded += metrics.succeeded;
        self.failed += metrics.failed();
        self.duplicates += metrics.duplicates;
        self.abandoned += metrics.abandoned;
        for (reason, count) in &metrics.failed_by_reason {
            *self.failed_by_reason.entry(reason.clone()).or_insert(0) += count;
        }
    }
}

/// A run stopped by a process-level error, after flushing what it had.
#[derive(Debug, thiserror::Error)]
#[error("run aborted: {source}")]
pub struct RunAborted {
    pub summary: RunSummary,
    #[source]
    pub source: AssemblyError,
}

// ---------------------------------------------------------------------------
// BatchOrchestrator
// ---------------------------------------------------------------------------

enum Outcome {
    Assembled(Arc<Project>),
    Failed(String),
    Fatal(AssemblyError),
}

/// Drives leads through the pipeline in fixed-size batches.
pub struct BatchOrchestrator {
    resolver: Arc<Resolver>,
    enricher: Option<Arc<GeocodingEnricher>>,
    ledger: Arc<Ledger>,
    sink: Arc<dyn ProjectSink>,
    settings: OrchestratorSettings,
    shutdown: watch::Receiver<bool>,
}

impl BatchOrchestrator {
    pub fn new(
        resolver: Arc<Resolver>,
        enricher: Option<Arc<GeocodingEnricher>>,
        ledger: Arc<Ledger>,
        sink: Arc<dyn ProjectSink>,
        settings: OrchestratorSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            resolver,
            enricher,
            ledger,
            sink,
            settings,
            shutdown,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Process every lead. Identifier-level failures are counted and
    /// skipped; a process-level failure stops the run once the current
    /// batch's finished projects are flushed.
    #[instrument(skip_all, fields(leads = leads.len()))]
    pub async fn run(
        &self,
        leads: Vec<ProjectLead>,
        progress: &dyn ProgressReporter,
    ) -> Result<RunSummary, RunAborted> {
        let start = Instant::now();
        let batches: Vec<Vec<ProjectLead>> = leads
            .chunks(self.settings.batch_size)
            .map(<[ProjectLead]>::to_vec)
            .collect();
        let batch_count = batches.len();
        progress.started(leads.len(), batch_count);
        info!(leads = leads.len(), batches = batch_count, "run starting");

        let mut summary = RunSummary::default();
        let mut remaining = batches.into_iter().enumerate().peekable();

        while let Some((index, batch)) = remaining.next() {
            let batch_id = index + 1;
            let (metrics, fatal) = self.run_batch(batch_id, batch, progress).await;
            summary.absorb(&metrics);

            if let Some(source) = fatal {
                // Everything after this batch is abandoned.
                summary.abandoned += remaining.map(|(_, b)| b.len()).sum::<usize>();
                summary.aborted = Some(source.to_string());
                summary.elapsed_ms = start.elapsed().as_millis() as u64;
                error!(error = %source, "run aborted");
                return Err(RunAborted { summary, source });
            }

            if self.stopping() {
                summary.abandoned += remaining.map(|(_, b)| b.len()).sum::<usize>();
                summary.interrupted = true;
                warn!(abandoned = summary.abandoned, "shutdown requested, stopping");
                break;
            }

            if remaining.peek().is_some() && !self.settings.pause.is_zero() {
                self.pause_between_batches().await;
            }
        }

        summary.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            duplicates = summary.duplicates,
            abandoned = summary.abandoned,
            "run finished"
        );
        Ok(summary)
    }

    async fn pause_between_batches(&self) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.pause) => {}
            _ = shutdown.wait_for(|stop| *stop) => debug!("pause cut short by shutdown"),
        }
    }

    /// Resolve one batch and flush it. Returns the batch metrics and the
    /// fatal error that stopped it, if any.
    #[instrument(skip_all, fields(batch_id = batch_id, size = batch.len()))]
    async fn run_batch(
        &self,
        batch_id: usize,
        batch: Vec<ProjectLead>,
        progress: &dyn ProgressReporter,
    ) -> (BatchMetrics, Option<AssemblyError>) {
        let started = Instant::now();
        let mut metrics = BatchMetrics::new(batch_id);
        let mut projects: Vec<Arc<Project>> = Vec::new();
        let mut fatal: Option<AssemblyError> = None;

        let semaphore = Arc::new(Semaphore::new(self.settings.concurrency));
        let mut tasks: JoinSet<(String, Outcome)> = JoinSet::new();

        for lead in batch {
            // Wait for a slot, tallying finished identifiers meanwhile.
            let permit = loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => break permit,
                    Some(joined) = tasks.join_next() => {
                        tally(joined, &mut metrics, &mut projects, &mut fatal, progress);
                    }
                }
            };
            let Ok(permit) = permit else {
                metrics.abandoned += 1;
                continue;
            };

            if fatal.is_some() || self.stopping() {
                metrics.abandoned += 1;
                continue;
            }

            if self.ledger.register(&lead) {
                metrics.duplicates += 1;
                continue;
            }

            metrics.attempted += 1;
            let resolver = self.resolver.clone();
            let enricher = self.enricher.clone();
            let ledger = self.ledger.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let id = lead.id.to_string();
                let outcome = assemble(&resolver, enricher.as_deref(), &ledger, &lead).await;
                (id, outcome)
            });
        }

        // Drain in-flight identifiers; nothing new starts.
        while let Some(joined) = tasks.join_next().await {
            tally(joined, &mut metrics, &mut projects, &mut fatal, progress);
        }
        metrics.set_elapsed(started.elapsed());

        if let Err(e) = self.sink.save(&projects, &metrics).await {
            error!(error = %e, "batch flush failed");
            fatal.get_or_insert(e);
        }

        info!(
            batch_id,
            attempted = metrics.attempted,
            succeeded = metrics.succeeded,
            failed = metrics.failed(),
            duplicates = metrics.duplicates,
            abandoned = metrics.abandoned,
            elapsed_ms = metrics.elapsed_ms,
            "batch complete"
        );
        progress.batch_done(&metrics);
        (metrics, fatal)
    }
}

/// Resolve, enrich and commit one identifier.
async fn assemble(
    resolver: &Resolver,
    enricher: Option<&GeocodingEnricher>,
    ledger: &Ledger,
    lead: &ProjectLead,
) -> Outcome {
    match resolver.resolve(lead).await {
        Ok(Resolution::Resolved(project)) => {
            let project = match enricher {
                Some(enricher) => enricher.enrich(project).await,
                None => project,
            };
            match project.validate() {
                Ok(()) => Outcome::Assembled(ledger.commit(project)),
                Err(e) => {
                    warn!(gid = %lead.id, error = %e, "assembled project is invalid");
                    ledger.fail(&lead.id, "invalid");
                    Outcome::Failed("invalid".into())
                }
            }
        }
        Ok(Resolution::Exhausted { reason }) => {
            ledger.fail(&lead.id, &reason);
            Outcome::Failed(reason)
        }
        Err(e) if e.is_fatal() => {
            ledger.fail(&lead.id, "aborted");
            Outcome::Fatal(e)
        }
        Err(e) => {
            warn!(gid = %lead.id, error = %e, "identifier failed");
            ledger.fail(&lead.id, "error");
            Outcome::Failed("error".into())
        }
    }
}

fn tally(
    joined: Result<(String, Outcome), tokio::task::JoinError>,
    metrics: &mut BatchMetrics,
    projects: &mut Vec<Arc<Project>>,
    fatal: &mut Option<AssemblyError>,
    progress: &dyn ProgressReporter,
) {
    match joined {
        Ok((id, Outcome::Assembled(project))) => {
            metrics.succeeded += 1;
            projects.push(project);
            progress.identifier_done(&id, true);
        }
        Ok((id, Outcome::Failed(reason))) => {
            warn!(gid = %id, %reason, "identifier failed");
            metrics.record_failure(reason);
            progress.identifier_done(&id, false);
        }
        Ok((id, Outcome::Fatal(e))) => {
            metrics.record_failure("aborted");
            progress.identifier_done(&id, false);
            fatal.get_or_insert(e);
        }
        Err(e) => {
            error!(error = %e, "resolution task panicked");
            metrics.record_failure("panicked");
        }
    }
}
