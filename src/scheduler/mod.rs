//! Concurrency-bounded execution of bound transformations.
//!
//! Every [`BoundTransformation`] becomes a job moving through
//!
//! ```text
//!  Pending ──admit──▶ Copying ──copies done──▶ Settling ──cleanup──▶ Finished
//!     │            (prepare, copy,          (unblock writes)   (unblock reads,
//!     │             repair, diff)                                cleanup)
//!     └──interrupt──▶ Skipped
//! ```
//!
//! The loop polls the nameserver for busy shards, never caching busy state
//! between iterations. Admission is bounded twice: at most `copies_per_host`
//! copying jobs may touch any host, and the copies issued by admitted jobs must
//! fit within `max_copies` minus the shards already busy.

mod interrupt;
mod operator;

pub use interrupt::{Interrupt, InterruptLevel};
pub use operator::{AutoConfirm, ConsoleOperator, Operator};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::metrics::SchedulerMetrics;
use crate::nameserver::{DryRunNameserver, Nameserver};
use crate::rollback::RollbackLog;
use crate::transform::{BoundTransformation, Phase};
use crate::types::ShardId;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Phases whose ops run asynchronously on the nameserver and are polled.
const ASYNC_PHASES: [Phase; 3] = [Phase::Copy, Phase::Repair, Phase::Diff];

/// Lifecycle of one scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Copying,
    Settling,
    Finished,
    /// Dropped by an interrupt before admission.
    Skipped,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Copying => write!(f, "copying"),
            JobState::Settling => write!(f, "settling"),
            JobState::Finished => write!(f, "finished"),
            JobState::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug)]
struct Job {
    id: Uuid,
    bound: BoundTransformation,
    state: JobState,
    /// Last async phase issued; busy checks watch its shards.
    phase: Phase,
    /// Hosts counted against `copies_per_host`.
    copy_hosts: BTreeSet<String>,
    admitted_at: Option<Instant>,
}

/// Outcome of a completed scheduler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Jobs that ran cleanup.
    pub finished: usize,
    /// Pending jobs dropped by an interrupt.
    pub skipped: usize,
    /// Loop iterations.
    pub polls: usize,
    pub elapsed: Duration,
}

/// Drives bound transformations to completion against a nameserver.
#[derive(Debug)]
pub struct TransformationScheduler {
    nameserver: Arc<dyn Nameserver>,
    dry_run: Option<Arc<DryRunNameserver>>,
    config: SchedulerConfig,
    operator: Arc<dyn Operator>,
    rollback: Option<Arc<dyn RollbackLog>>,
    interrupt: Interrupt,
    metrics: Arc<SchedulerMetrics>,
    jobs: Vec<Job>,
}

impl TransformationScheduler {
    /// Create a scheduler. In dry-run mode mutations are logged, not sent.
    pub fn new(
        nameserver: Arc<dyn Nameserver>,
        jobs: Vec<BoundTransformation>,
        config: SchedulerConfig,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(job) = jobs.iter().find(|job| job.copy_count() > config.max_copies) {
            return Err(Error::Config(format!(
                "{} needs {} copies but max_copies is {}",
                job.forwarding(),
                job.copy_count(),
                config.max_copies
            )));
        }

        let dry_run = config
            .dry_run
            .then(|| Arc::new(DryRunNameserver::new(nameserver.clone())));
        let nameserver: Arc<dyn Nameserver> = match &dry_run {
            Some(dry) => dry.clone(),
            None => nameserver,
        };

        let jobs = jobs
            .into_iter()
            .map(|bound| Job {
                id: Uuid::new_v4(),
                copy_hosts: bound.involved_hosts(Phase::Copy),
                bound,
                state: JobState::Pending,
                phase: Phase::Prepare,
                admitted_at: None,
            })
            .collect();

        Ok(Self {
            nameserver,
            dry_run,
            config,
            operator: Arc::new(ConsoleOperator),
            rollback: None,
            interrupt: Interrupt::new(),
            metrics: Arc::new(SchedulerMetrics::new()),
            jobs,
        })
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    /// Record the inverse of every applied op.
    pub fn with_rollback_log(mut self, log: Arc<dyn RollbackLog>) -> Self {
        self.rollback = Some(log);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SchedulerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Handle that cancels this scheduler.
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    /// Mutations withheld in dry-run mode.
    pub fn planned(&self) -> Vec<String> {
        self.dry_run
            .as_ref()
            .map(|dry| dry.planned())
            .unwrap_or_default()
    }

    /// Job ids and states, in submission order.
    pub fn job_states(&self) -> Vec<(Uuid, JobState)> {
        self.jobs.iter().map(|job| (job.id, job.state)).collect()
    }

    /// Run until every job has finished or been skipped.
    ///
    /// Returns [`Error::ForcedExit`] after a second interrupt; the nameserver
    /// may then hold half-applied transformations.
    pub async fn run(&mut self) -> Result<SchedulerReport> {
        let started = Instant::now();
        let mut polls = 0;

        tracing::info!(
            jobs = self.jobs.len(),
            max_copies = self.config.max_copies,
            copies_per_host = self.config.copies_per_host,
            batch_finish = self.config.batch_finish,
            dry_run = self.config.dry_run,
            "Starting scheduler"
        );

        loop {
            match self.interrupt.level() {
                InterruptLevel::Forced => {
                    tracing::error!(
                        copying = self.count(JobState::Copying),
                        settling = self.count(JobState::Settling),
                        "Forced exit, in-flight jobs abandoned"
                    );
                    return Err(Error::ForcedExit);
                }
                InterruptLevel::Draining => self.drop_pending(),
                InterruptLevel::Running => {}
            }
            if self.is_done() {
                break;
            }
            polls += 1;

            let busy: BTreeSet<ShardId> = if self.config.dry_run {
                BTreeSet::new()
            } else {
                self.nameserver
                    .get_busy_shards()
                    .await?
                    .into_iter()
                    .map(|info| info.id)
                    .collect()
            };

            self.advance_copying(&busy).await?;
            if !self.config.batch_finish {
                self.finish_settled().await?;
            }
            self.admit(busy.len()).await?;
            if self.config.batch_finish
                && self.count(JobState::Pending) == 0
                && self.count(JobState::Copying) == 0
            {
                self.finish_settled().await?;
            }

            self.metrics.record_poll(
                self.count(JobState::Pending),
                self.count(JobState::Copying),
                self.count(JobState::Settling),
                busy.len(),
            );
            self.operator.progress(&self.progress_line(busy.len()));

            if self.is_done() {
                break;
            }
            if !self.config.dry_run {
                let running = self.interrupt.level() == InterruptLevel::Running;
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.interrupt.drained(), if running => {}
                    _ = self.interrupt.forced() => {}
                }
            }
        }

        self.nameserver.reload_updated_forwardings().await?;

        let report = SchedulerReport {
            finished: self.count(JobState::Finished),
            skipped: self.count(JobState::Skipped),
            polls,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            finished = report.finished,
            skipped = report.skipped,
            polls = report.polls,
            elapsed = ?report.elapsed,
            "Scheduler finished"
        );
        Ok(report)
    }

    fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|job| job.state == state).count()
    }

    fn indices(&self, state: JobState) -> Vec<usize> {
        self.jobs
            .iter()
            .enumerate()
            .filter(|(_, job)| job.state == state)
            .map(|(i, _)| i)
            .collect()
    }

    fn is_done(&self) -> bool {
        self.count(JobState::Pending) == 0
            && self.count(JobState::Copying) == 0
            && self.count(JobState::Settling) == 0
    }

    fn drop_pending(&mut self) {
        let mut dropped = 0;
        for job in &mut self.jobs {
            if job.state == JobState::Pending {
                job.state = JobState::Skipped;
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.metrics.jobs_skipped.inc_by(dropped);
            tracing::warn!(dropped, "Dropped pending jobs");
        }
    }

    async fn apply(&self, index: usize, phase: Phase) -> Result<()> {
        let job = &self.jobs[index];
        if !job.bound.has_ops(phase) {
            return Ok(());
        }
        job.bound
            .apply(self.nameserver.as_ref(), phase, self.rollback.as_deref())
            .await?;
        self.metrics
            .ops_applied
            .inc_by(phase.as_str(), job.bound.ops(phase).len() as u64);
        Ok(())
    }

    /// Ask the operator, giving up as soon as a forced exit is requested.
    async fn confirm(&self, message: &str) -> Result<bool> {
        tokio::select! {
            answer = self.operator.confirm(self.config.force, message) => answer,
            _ = self.interrupt.forced() => {
                tracing::error!(message, "Forced exit while waiting for confirmation");
                Err(Error::ForcedExit)
            }
        }
    }

    /// Issue the next verification phase, or settle, for jobs whose shards went idle.
    async fn advance_copying(&mut self, busy: &BTreeSet<ShardId>) -> Result<()> {
        for i in self.indices(JobState::Copying) {
            let job = &self.jobs[i];
            if job
                .bound
                .involved_shards(job.phase)
                .iter()
                .any(|id| busy.contains(id))
            {
                continue;
            }

            let next = ASYNC_PHASES
                .into_iter()
                .filter(|phase| *phase > job.phase)
                .find(|phase| job.bound.has_ops(*phase));

            match next {
                Some(phase) => {
                    self.apply(i, phase).await?;
                    let job = &mut self.jobs[i];
                    job.phase = phase;
                    tracing::info!(job = %job.id, forwarding = %job.bound.forwarding(), %phase, "Issued verification");
                }
                None => {
                    self.apply(i, Phase::UnblockWrites).await?;
                    let job = &mut self.jobs[i];
                    job.state = JobState::Settling;
                    tracing::info!(job = %job.id, forwarding = %job.bound.forwarding(), "Job settled");
                }
            }
        }
        Ok(())
    }

    /// Unblock reads and clean up every settled job.
    async fn finish_settled(&mut self) -> Result<()> {
        let settled = self.indices(JobState::Settling);
        if settled.is_empty() {
            return Ok(());
        }

        let gated = settled
            .iter()
            .any(|&i| self.jobs[i].bound.has_ops(Phase::UnblockReads));
        if gated {
            let message = format!("{} job(s) ready to unblock reads. Proceed?", settled.len());
            if !self.confirm(&message).await? {
                return Err(Error::Declined);
            }
            for &i in &settled {
                self.apply(i, Phase::UnblockReads).await?;
            }
            if !self.confirm("Reads unblocked. Continue with cleanup?").await? {
                return Err(Error::Declined);
            }
        }

        for &i in &settled {
            self.apply(i, Phase::Cleanup).await?;
            let job = &mut self.jobs[i];
            job.state = JobState::Finished;
            let elapsed = job.admitted_at.map(|t| t.elapsed()).unwrap_or_default();
            self.metrics.record_finished(elapsed);
            tracing::info!(
                job = %job.id,
                forwarding = %job.bound.forwarding(),
                elapsed = ?elapsed,
                "Job finished"
            );
        }
        Ok(())
    }

    /// Admit pending jobs within the host and global copy limits.
    ///
    /// Each job costs its copy count (at least one) against `max_copies` minus
    /// the busy shards. Copies of copying jobs are counted too when the
    /// nameserver reports fewer busy shards, as it does in dry-run mode.
    async fn admit(&mut self, busy: usize) -> Result<()> {
        let copying = self.indices(JobState::Copying);
        let in_flight: usize = copying
            .iter()
            .map(|&i| self.jobs[i].bound.copy_count().max(1))
            .sum();
        let mut budget = self.config.max_copies.saturating_sub(busy.max(in_flight));

        let mut load: BTreeMap<String, usize> = BTreeMap::new();
        for &i in &copying {
            for host in &self.jobs[i].copy_hosts {
                *load.entry(host.clone()).or_insert(0) += 1;
            }
        }

        let mut admitted = Vec::new();
        for i in self.indices(JobState::Pending) {
            if budget == 0 {
                break;
            }
            let cost = self.jobs[i].bound.copy_count().max(1);
            if cost > budget {
                continue;
            }
            let hosts = &self.jobs[i].copy_hosts;
            if hosts
                .iter()
                .any(|h| load.get(h).copied().unwrap_or(0) >= self.config.copies_per_host)
            {
                continue;
            }
            for host in hosts {
                *load.entry(host.clone()).or_insert(0) += 1;
            }
            budget -= cost;
            admitted.push(i);
        }
        if admitted.is_empty() {
            return Ok(());
        }

        for &i in &admitted {
            self.apply(i, Phase::Prepare).await?;
        }
        self.nameserver.reload_updated_forwardings().await?;

        for &i in &admitted {
            self.apply(i, Phase::Copy).await?;
            let copies = self.jobs[i].bound.copy_count();
            self.metrics.copies_issued.inc_by(copies as u64);
            self.metrics.jobs_admitted.inc();

            let job = &mut self.jobs[i];
            job.state = JobState::Copying;
            job.phase = Phase::Copy;
            job.admitted_at = Some(Instant::now());
            tracing::info!(
                job = %job.id,
                forwarding = %job.bound.forwarding(),
                hosts = ?job.copy_hosts,
                copies,
                "Admitted job"
            );
        }
        Ok(())
    }

    fn progress_line(&self, busy: usize) -> String {
        format!(
            "pending={} copying={} settling={} finished={} skipped={} busy={}",
            self.count(JobState::Pending),
            self.count(JobState::Copying),
            self.count(JobState::Settling),
            self.count(JobState::Finished),
            self.count(JobState::Skipped),
            busy,
        )
    }
}
