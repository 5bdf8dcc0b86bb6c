//! Central judging engine.
//!
//! Walks the task list in work units, asks each rater for a verdict on every
//! task it has not judged yet, and commits each finished unit to the resume
//! store before starting the next one. Completion is tracked per (task,
//! rater): a verdict already in the store is never requested again, even
//! when another rater failed on the same task.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::adapter::{verdict_from_text, JudgeAdapter};
use crate::batch::BatchOrchestrator;
use crate::checkpoint::{ResumeStore, WorkUnitKey};
use crate::error::BatchError;
use crate::model::{FailureKind, JudgeTask, JudgeVerdict, ScoredItem};
use crate::prompts;

/// Configuration for the judging engine.
#[derive(Debug, Clone)]
pub struct JudgeEngineConfig {
    /// Maximum concurrent per-item provider calls across sync raters.
    pub parallelism: usize,
    /// Tasks committed together. Raised to a full batch round when a batch
    /// rater is present.
    pub work_unit_size: usize,
    /// First task (global row index) to consider.
    pub start_index: usize,
    /// Maximum number of tasks to consider from `start_index`.
    pub limit: Option<usize>,
    /// Record a failed batch job and move on instead of stopping the run.
    pub continue_on_batch_failure: bool,
}

impl Default for JudgeEngineConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            work_unit_size: 16,
            start_index: 0,
            limit: None,
            continue_on_batch_failure: false,
        }
    }
}

/// How a rater reaches its provider.
#[derive(Clone)]
pub enum RaterBackend {
    /// One completion per item.
    Sync(Arc<JudgeAdapter>),
    /// Whole units through a batch job.
    Batch {
        orchestrator: Arc<BatchOrchestrator>,
        model: String,
    },
}

#[derive(Clone)]
pub struct Rater {
    pub id: String,
    pub backend: RaterBackend,
}

impl Rater {
    pub fn sync(adapter: JudgeAdapter) -> Self {
        Self {
            id: adapter.rater_id().to_string(),
            backend: RaterBackend::Sync(Arc::new(adapter)),
        }
    }

    pub fn batch(id: impl Into<String>, orchestrator: Arc<BatchOrchestrator>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            backend: RaterBackend::Batch {
                orchestrator,
                model: model.into(),
            },
        }
    }
}

/// Progress reporting trait.
pub trait ProgressReporter: Send + Sync {
    fn on_run_start(&self, pending: usize, skipped: usize);
    fn on_unit_complete(&self, rows: &[ScoredItem], done: usize, pending: usize);
    fn on_unit_failed(&self, rows: &Range<u64>, error: &str);
}

/// No-op progress reporter.
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_run_start(&self, _: usize, _: usize) {}
    fn on_unit_complete(&self, _: &[ScoredItem], _: usize, _: usize) {}
    fn on_unit_failed(&self, _: &Range<u64>, _: &str) {}
}

/// A unit that was not committed because a batch job failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUnit {
    pub rater_id: String,
    /// Global row indices of the unit.
    pub rows: Range<u64>,
    pub error: String,
    pub timed_out: bool,
}

/// Summary of one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeRunReport {
    pub run_id: Uuid,
    /// Tasks inside the selected window.
    pub selected: usize,
    /// Tasks skipped because they were already committed.
    pub skipped: usize,
    /// Tasks committed in this run with a verdict from every rater.
    pub judged: usize,
    /// Tasks committed in this run that still lack some rater's verdict.
    #[serde(default)]
    pub partial: usize,
    /// Error verdicts recorded per rater in this run.
    pub errors_by_rater: BTreeMap<String, usize>,
    pub failed_units: Vec<FailedUnit>,
    pub duration_ms: u64,
}

/// A task with at least one rater still owing a verdict.
struct PendingTask<'a> {
    task: &'a JudgeTask,
    /// Indices into the engine's raters.
    missing: Vec<usize>,
}

/// The central judging engine.
pub struct JudgeEngine {
    raters: Vec<Rater>,
    config: JudgeEngineConfig,
}

impl JudgeEngine {
    pub fn new(raters: Vec<Rater>, config: JudgeEngineConfig) -> Self {
        Self { raters, config }
    }

    pub fn rater_ids(&self) -> Vec<&str> {
        self.raters.iter().map(|r| r.id.as_str()).collect()
    }

    /// The tasks inside the configured start/limit window.
    fn window<'a>(&self, tasks: &'a [JudgeTask]) -> &'a [JudgeTask] {
        let start = self.config.start_index.min(tasks.len());
        let end = match self.config.limit {
            Some(limit) => start.saturating_add(limit).min(tasks.len()),
            None => tasks.len(),
        };
        &tasks[start..end]
    }

    /// Tasks per work unit. With a batch rater present a unit covers at
    /// least one full batch round (chunk size times concurrency), so every
    /// sub-batch of the round is in flight together.
    fn unit_size(&self) -> usize {
        let batch_round = self
            .raters
            .iter()
            .filter_map(|r| match &r.backend {
                RaterBackend::Batch { orchestrator, .. } => {
                    let c = orchestrator.config();
                    Some(c.chunk_size.max(1).saturating_mul(c.concurrency.max(1)))
                }
                RaterBackend::Sync(_) => None,
            })
            .max()
            .unwrap_or(0);
        self.config.work_unit_size.max(1).max(batch_round)
    }

    /// Judge every pending (task, rater) pair, committing each unit to
    /// `store`. Verdicts already committed are never requested again.
    pub async fn run(
        &self,
        tasks: &[JudgeTask],
        store: &mut ResumeStore,
        progress: &dyn ProgressReporter,
    ) -> Result<JudgeRunReport> {
        let start = Instant::now();
        let window = self.window(tasks);
        let pending: Vec<PendingTask<'_>> = window
            .iter()
            .filter_map(|task| {
                let done = store.verdicts(&WorkUnitKey::for_task(task));
                let missing: Vec<usize> = self
                    .raters
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| done.map_or(true, |v| !v.contains_key(&r.id)))
                    .map(|(i, _)| i)
                    .collect();
                (!missing.is_empty()).then_some(PendingTask { task, missing })
            })
            .collect();
        let skipped = window.len() - pending.len();
        let unit_size = self.unit_size();

        tracing::info!(
            run_id = %store.run_id(),
            selected = window.len(),
            pending = pending.len(),
            skipped,
            unit_size,
            raters = ?self.rater_ids(),
            "starting judging run"
        );
        progress.on_run_start(pending.len(), skipped);

        let mut report = JudgeRunReport {
            run_id: store.run_id(),
            selected: window.len(),
            skipped,
            judged: 0,
            partial: 0,
            errors_by_rater: BTreeMap::new(),
            failed_units: Vec::new(),
            duration_ms: 0,
        };

        for unit in pending.chunks(unit_size) {
            // Positions in `unit` each rater still owes a verdict for.
            let asked: Vec<Vec<usize>> = (0..self.raters.len())
                .map(|r| {
                    unit.iter()
                        .enumerate()
                        .filter(|(_, p)| p.missing.contains(&r))
                        .map(|(i, _)| i)
                        .collect()
                })
                .collect();
            let per_rater = join_all(self.raters.iter().zip(&asked).map(|(rater, positions)| {
                let subset: Vec<&JudgeTask> = positions.iter().map(|&i| unit[i].task).collect();
                async move {
                    if subset.is_empty() {
                        return Ok(Vec::new());
                    }
                    self.judge_unit(rater, &subset).await
                }
            }))
            .await;

            let mut fresh: Vec<BTreeMap<String, JudgeVerdict>> = vec![BTreeMap::new(); unit.len()];
            let mut failure = None;
            for ((rater, positions), outcome) in self.raters.iter().zip(&asked).zip(per_rater) {
                match outcome {
                    Ok(list) => {
                        for (&i, v) in positions.iter().zip(list) {
                            if v.is_error() {
                                *report.errors_by_rater.entry(rater.id.clone()).or_default() += 1;
                            }
                            fresh[i].insert(rater.id.clone(), v);
                        }
                    }
                    Err(e) => {
                        let indices: Vec<u64> = positions.iter().map(|&i| unit[i].task.row_index).collect();
                        let rows = row_range(&indices);
                        tracing::error!(rater = %rater.id, rows = ?rows, "batch job failed, rater left pending: {e}");
                        progress.on_unit_failed(&rows, &e.to_string());
                        report.failed_units.push(FailedUnit {
                            rater_id: rater.id.clone(),
                            rows: rows.clone(),
                            error: e.to_string(),
                            timed_out: e.is_timeout(),
                        });
                        failure.get_or_insert((rater.id.clone(), rows, e));
                    }
                }
            }

            // Commit every task that gained a verdict, merged with what was
            // committed for it before.
            let mut rows = Vec::new();
            for (pending_task, verdicts) in unit.iter().zip(fresh) {
                if verdicts.is_empty() {
                    continue;
                }
                let task = pending_task.task;
                let mut merged = store
                    .verdicts(&WorkUnitKey::for_task(task))
                    .cloned()
                    .unwrap_or_default();
                merged.extend(verdicts);
                if self.raters.iter().all(|r| merged.contains_key(&r.id)) {
                    report.judged += 1;
                } else {
                    report.partial += 1;
                }
                rows.push(ScoredItem::from_task(task, merged));
            }
            if !rows.is_empty() {
                let committed = row_range(&rows.iter().map(|r| r.row_index).collect::<Vec<_>>());
                store.append(&rows).with_context(|| {
                    format!("failed to commit rows {}..{}", committed.start, committed.end)
                })?;
                progress.on_unit_complete(&rows, report.judged + report.partial, pending.len());
            }

            if let Some((rater_id, rows, e)) = failure {
                if !self.config.continue_on_batch_failure {
                    return Err(anyhow::Error::new(e).context(format!(
                        "batch job for rater '{rater_id}' failed on rows {}..{}",
                        rows.start, rows.end
                    )));
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            judged = report.judged,
            partial = report.partial,
            skipped = report.skipped,
            failed_units = report.failed_units.len(),
            "judging run finished in {:?}",
            Duration::from_millis(report.duration_ms)
        );
        Ok(report)
    }

    /// One rater's verdicts for one unit, in task order.
    async fn judge_unit(&self, rater: &Rater, unit: &[&JudgeTask]) -> Result<Vec<JudgeVerdict>, BatchError> {
        match &rater.backend {
            RaterBackend::Sync(adapter) => Ok(self.judge_sync(adapter, unit).await),
            RaterBackend::Batch { orchestrator, model } => {
                judge_batch(&rater.id, orchestrator, model, unit).await
            }
        }
    }

    async fn judge_sync(&self, adapter: &Arc<JudgeAdapter>, unit: &[&JudgeTask]) -> Vec<JudgeVerdict> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut futures = FuturesUnordered::new();

        for (idx, task) in unit.iter().enumerate() {
            let adapter = Arc::clone(adapter);
            let semaphore = Arc::clone(&semaphore);
            futures.push(async move {
                let verdict = match semaphore.acquire_owned().await {
                    Ok(_permit) => adapter.judge(&task.item, &task.group.topic).await,
                    Err(_) => JudgeVerdict::error(
                        adapter.rater_id(),
                        FailureKind::Transport,
                        "worker pool closed",
                        "",
                    ),
                };
                (idx, verdict)
            });
        }

        let mut slots: Vec<Option<JudgeVerdict>> = vec![None; unit.len()];
        while let Some((idx, verdict)) = futures.next().await {
            slots[idx] = Some(verdict);
        }
        slots
            .into_iter()
            .map(|v| {
                v.unwrap_or_else(|| {
                    JudgeVerdict::error(adapter.rater_id(), FailureKind::MissingResult, "no verdict produced", "")
                })
            })
            .collect()
    }
}

async fn judge_batch(
    rater_id: &str,
    orchestrator: &BatchOrchestrator,
    model: &str,
    unit: &[&JudgeTask],
) -> Result<Vec<JudgeVerdict>, BatchError> {
    let prompts: Vec<(String, String)> = unit
        .iter()
        .map(|t| {
            (
                prompts::system_prompt(t.item.item_type(), false),
                prompts::user_prompt(&t.item, &t.group.topic),
            )
        })
        .collect();

    let mut texts = Vec::with_capacity(unit.len());
    for chunk in orchestrator.run(&prompts, model).await {
        texts.extend(chunk.outcome?);
    }

    Ok(unit
        .iter()
        .zip(texts)
        .map(|(task, raw)| {
            let item_type = task.item.item_type();
            if raw.is_empty() {
                return JudgeVerdict::error(rater_id, FailureKind::MissingResult, "empty batch result", "");
            }
            verdict_from_text(rater_id, item_type, &raw).unwrap_or_else(|e| {
                JudgeVerdict::error(rater_id, FailureKind::Parse, e.to_string(), raw)
            })
        })
        .collect())
}

/// Smallest range of global row indices covering `rows`.
fn row_range(rows: &[u64]) -> Range<u64> {
    let first = rows.iter().copied().min().unwrap_or(0);
    let last = rows.iter().copied().max().map_or(first, |m| m + 1);
    first..last
}
