//! Task dispatch and deduplication.
//!
//! Every task line is claimed against a [`TaskRegistry`] in input order; the
//! first line for a repository wins and later ones are discarded. Each
//! claimed task gets its own pipeline, optionally capped by a semaphore.
//! Results flow through a channel sized to the task count, so no pipeline
//! ever waits on the collector, and the dispatcher joins every pipeline
//! before handing the results to the aggregator.

use crate::errors::{Stage, StageError, StageErrorKind};
use crate::pipeline::{Outcome, Pipeline, RepositoryState};
use crate::report::{Aggregator, DiscardedLine, RepoResult, RunReport};
use crate::task::{RepoKey, RepositoryTask, TaskLine};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

/// Set of repository keys already claimed in this run.
pub trait TaskRegistry: Send + Sync {
    /// Atomically claim `key`. Returns `true` only for the first caller.
    fn claim(&self, key: &RepoKey) -> bool;
}

/// Mutex-guarded in-process registry.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    claimed: Mutex<HashSet<RepoKey>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskRegistry for InMemoryRegistry {
    fn claim(&self, key: &RepoKey) -> bool {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        claimed.insert(key.clone())
    }
}

/// What the dispatcher decided for one task line.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Claimed(RepositoryTask),
    Duplicate {
        task: RepositoryTask,
        /// Line that claimed the key first.
        first_line: usize,
    },
    Malformed(StageError),
}

/// Claim every line in order. Pure apart from the registry.
pub fn plan(lines: &[TaskLine], registry: &dyn TaskRegistry) -> Vec<(TaskLine, Dispatch)> {
    let mut first_lines = std::collections::HashMap::new();
    lines
        .iter()
        .map(|line| {
            let decision = match &line.parsed {
                Err(err) => Dispatch::Malformed(StageError::new(
                    line.report_key(),
                    Stage::Parse,
                    StageErrorKind::Malformed,
                    err,
                )),
                Ok(task) => {
                    let key = task.key();
                    if registry.claim(&key) {
                        first_lines.insert(key, task.line);
                        Dispatch::Claimed(task.clone())
                    } else {
                        Dispatch::Duplicate {
                            task: task.clone(),
                            first_line: first_lines.get(&key).copied().unwrap_or_default(),
                        }
                    }
                }
            };
            (line.clone(), decision)
        })
        .collect()
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Started { repo: String },
    Finished { repo: String, label: &'static str },
}

/// Fans claimed tasks out to concurrent pipelines.
pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    registry: Arc<dyn TaskRegistry>,
    max_parallel: Option<usize>,
    event_tx: Option<mpsc::UnboundedSender<DispatchEvent>>,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>, registry: Arc<dyn TaskRegistry>) -> Self {
        Self {
            pipeline,
            registry,
            max_parallel: None,
            event_tx: None,
        }
    }

    /// Cap concurrently running pipelines; `None` leaves fan-out unbounded.
    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel.filter(|n| *n > 0);
        self
    }

    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(tx: &Option<mpsc::UnboundedSender<DispatchEvent>>, event: DispatchEvent) {
        if let Some(tx) = tx {
            tx.send(event).ok();
        }
    }

    /// Run every task line and return the aggregated report.
    pub async fn run(&self, lines: Vec<TaskLine>) -> RunReport {
        let mut aggregator = Aggregator::new(self.pipeline.is_dry_run());
        let decisions = plan(&lines, self.registry.as_ref());

        let (result_tx, mut result_rx) = mpsc::channel::<RepoResult>(decisions.len().max(1));
        let semaphore = self.max_parallel.map(|n| Arc::new(Semaphore::new(n)));
        let mut join_set = JoinSet::new();

        for (line, decision) in decisions {
            match decision {
                Dispatch::Malformed(err) => {
                    tracing::warn!(line = line.line, raw = %line.raw, "malformed task line");
                    aggregator.record(RepoResult {
                        repo: err.repo_key.clone(),
                        line: line.line,
                        target: String::new(),
                        state: RepositoryState::Failed(Stage::Parse),
                        outcome: Outcome::Failed(err),
                        duration_ms: 0,
                    });
                }
                Dispatch::Duplicate { task, first_line } => {
                    tracing::info!(repo = %task.key(), line = task.line, first_line, "duplicate task discarded");
                    aggregator.discard(DiscardedLine {
                        line: task.line,
                        raw: line.raw.clone(),
                        repo: task.key().to_string(),
                        first_line,
                    });
                }
                Dispatch::Claimed(task) => {
                    let pipeline = Arc::clone(&self.pipeline);
                    let semaphore = semaphore.clone();
                    let result_tx = result_tx.clone();
                    let event_tx = self.event_tx.clone();

                    join_set.spawn(async move {
                        // Hold until complete.
                        let _permit = match semaphore {
                            Some(sem) => sem.acquire_owned().await.ok(),
                            None => None,
                        };
                        let repo = task.key().to_string();
                        Self::emit(&event_tx, DispatchEvent::Started { repo: repo.clone() });

                        let started = Instant::now();
                        let result = pipeline.run(&task).await;
                        let label = result.outcome.label();

                        // Capacity equals the task count: never blocks.
                        result_tx
                            .send(RepoResult {
                                repo: repo.clone(),
                                line: task.line,
                                target: task.relative_path.clone(),
                                state: result.state,
                                outcome: result.outcome,
                                duration_ms: started.elapsed().as_millis() as u64,
                            })
                            .await
                            .ok();
                        Self::emit(&event_tx, DispatchEvent::Finished { repo, label });
                    });
                }
            }
        }
        drop(result_tx);

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "pipeline task panicked");
            }
        }
        while let Some(result) = result_rx.recv().await {
            aggregator.record(result);
        }

        aggregator.finish()
    }
}
