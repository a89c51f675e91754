//! Per-backend fan-out with a single join point.

use crate::backend_registry::BackendRegistry;
use crate::error::{AdapterError, StoreError};
use crate::model::{FeatureRef, HashEntityKey, OnlineStoreRow, ReadResult};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

enum TaskOutcome<T> {
    Completed(T),
    TimedOut,
    Lost,
}

/// Result of one backend's share of a write.
#[derive(Debug, Clone)]
pub struct BackendWriteOutcome {
    pub backend: String,
    pub rows: usize,
    pub written: usize,
    pub error: Option<AdapterError>,
}

impl BackendWriteOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-backend outcomes of one `online_write` call, sorted by backend name.
#[derive(Debug, Clone, Default)]
pub struct WriteReport {
    pub outcomes: Vec<BackendWriteOutcome>,
}

impl WriteReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(BackendWriteOutcome::is_success)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &BackendWriteOutcome> {
        self.outcomes.iter().filter(|outcome| outcome.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BackendWriteOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.is_success())
    }

    pub fn rows_written(&self) -> usize {
        self.outcomes.iter().map(|outcome| outcome.written).sum()
    }

    pub(crate) fn describe_failures(&self) -> String {
        self.failed()
            .map(|outcome| {
                format!(
                    "{} ({} of {} rows written): {}",
                    outcome.backend,
                    outcome.written,
                    outcome.rows,
                    outcome
                        .error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn into_adapter_error(err: StoreError) -> AdapterError {
    match err {
        StoreError::Backend { source, .. } => source,
        other => AdapterError::connection(other.to_string()),
    }
}

pub(crate) struct BatchCoordinator {
    batch_size: usize,
    timeout: Option<Duration>,
}

impl BatchCoordinator {
    pub(crate) fn new(batch_size: usize, timeout: Option<Duration>) -> Self {
        Self {
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    /// Runs one task per backend and waits for all of them, or until the timeout. Tasks
    /// still running at the deadline are aborted on a best-effort basis; tasks that
    /// finished before it keep their results.
    async fn fan_out<T, Fut>(&self, tasks: Vec<(String, Fut)>) -> Vec<(String, TaskOutcome<T>)>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut backends = Vec::with_capacity(tasks.len());
        let mut join_set = JoinSet::new();
        for (index, (backend, task)) in tasks.into_iter().enumerate() {
            backends.push(backend);
            join_set.spawn(async move { (index, task.await) });
        }
        let mut outcomes: Vec<Option<T>> = backends.iter().map(|_| None).collect();

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut timed_out = false;
        loop {
            let next = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            timed_out = true;
                            join_set.abort_all();
                            break;
                        }
                    }
                }
                None => join_set.join_next().await,
            };
            match next {
                Some(Ok((index, value))) => outcomes[index] = Some(value),
                Some(Err(err)) => warn!("Backend task did not complete: {}", err),
                None => break,
            }
        }

        backends
            .into_iter()
            .zip(outcomes)
            .map(|(backend, outcome)| {
                let outcome = match outcome {
                    Some(value) => TaskOutcome::Completed(value),
                    None if timed_out => TaskOutcome::TimedOut,
                    None => TaskOutcome::Lost,
                };
                (backend, outcome)
            })
            .collect()
    }

    fn incomplete_message(&self, outcome_timed_out: bool) -> String {
        match (outcome_timed_out, self.timeout) {
            (true, Some(timeout)) => format!("timed out after {}ms", timeout.as_millis()),
            _ => "backend task was aborted".to_string(),
        }
    }

    /// Reads `features` for every key from each backend. A backend that fails or times out
    /// yields an `Err` for its own share only.
    pub(crate) async fn read(
        &self,
        registry: &Arc<BackendRegistry>,
        keys: &Arc<Vec<HashEntityKey>>,
        requests: Vec<(String, Vec<FeatureRef>)>,
    ) -> Vec<(String, Result<Vec<ReadResult>, Arc<str>>)> {
        let tasks: Vec<_> = requests
            .into_iter()
            .map(|(backend, features)| {
                let registry = registry.clone();
                let keys = keys.clone();
                let batch_size = self.batch_size;
                let name = backend.clone();
                let task = async move {
                    let store = registry.resolve(&name).await?;
                    let mut rows = Vec::with_capacity(keys.len() * features.len());
                    for chunk in keys.chunks(batch_size) {
                        debug!(
                            "Reading {} keys x {} features from backend {}",
                            chunk.len(),
                            features.len(),
                            name
                        );
                        let chunk_rows = store
                            .get_feature_values(chunk, &features)
                            .await
                            .map_err(|err| StoreError::backend(&name, err))?;
                        if chunk_rows.len() != chunk.len() * features.len() {
                            return Err(StoreError::backend(
                                &name,
                                AdapterError::schema(format!(
                                    "expected {} rows, backend returned {}",
                                    chunk.len() * features.len(),
                                    chunk_rows.len()
                                )),
                            ));
                        }
                        rows.extend(chunk_rows);
                    }
                    Ok::<_, StoreError>(rows)
                };
                (backend, task)
            })
            .collect();

        self.fan_out(tasks)
            .await
            .into_iter()
            .map(|(backend, outcome)| {
                let result = match outcome {
                    TaskOutcome::Completed(Ok(rows)) => Ok(rows),
                    TaskOutcome::Completed(Err(err)) => Err(Arc::from(err.to_string())),
                    TaskOutcome::TimedOut => Err(Arc::from(format!(
                        "backend '{}' {}",
                        backend,
                        self.incomplete_message(true)
                    ))),
                    TaskOutcome::Lost => Err(Arc::from(format!(
                        "backend '{}' {}",
                        backend,
                        self.incomplete_message(false)
                    ))),
                };
                if let Err(message) = &result {
                    warn!("Degraded read: {}", message);
                }
                (backend, result)
            })
            .collect()
    }

    /// Writes each backend's rows in `batch_size` chunks. Backends are independent: a
    /// failure on one does not roll back the others. Rows committed by a backend that
    /// times out mid-write are still counted in its outcome.
    pub(crate) async fn write(
        &self,
        registry: &Arc<BackendRegistry>,
        batches: Vec<(String, Vec<OnlineStoreRow>)>,
    ) -> WriteReport {
        let row_counts: Vec<usize> = batches.iter().map(|(_, rows)| rows.len()).collect();
        let progress: Vec<Arc<AtomicUsize>> = batches
            .iter()
            .map(|_| Arc::new(AtomicUsize::new(0)))
            .collect();
        let tasks: Vec<_> = batches
            .into_iter()
            .zip(&progress)
            .map(|((backend, rows), progress)| {
                let registry = registry.clone();
                let progress = progress.clone();
                let batch_size = self.batch_size;
                let name = backend.clone();
                let task = async move {
                    let store = match registry.resolve(&name).await {
                        Ok(store) => store,
                        Err(err) => return (0, Some(into_adapter_error(err))),
                    };
                    let mut written = 0;
                    let mut rows = rows.into_iter();
                    loop {
                        let chunk: Vec<OnlineStoreRow> = rows.by_ref().take(batch_size).collect();
                        if chunk.is_empty() {
                            return (written, None);
                        }
                        debug!("Writing {} rows to backend {}", chunk.len(), name);
                        match store.put_feature_values(chunk).await {
                            Ok(count) => {
                                written += count;
                                progress.store(written, Ordering::Release);
                            }
                            Err(err) => return (written, Some(err)),
                        }
                    }
                };
                (backend, task)
            })
            .collect();

        let mut outcomes: Vec<BackendWriteOutcome> = self
            .fan_out(tasks)
            .await
            .into_iter()
            .zip(row_counts.into_iter().zip(progress))
            .map(|((backend, outcome), (rows, progress))| {
                let (written, error) = match outcome {
                    TaskOutcome::Completed(result) => result,
                    TaskOutcome::TimedOut => (
                        progress.load(Ordering::Acquire),
                        Some(AdapterError::connection(self.incomplete_message(true))),
                    ),
                    TaskOutcome::Lost => (
                        progress.load(Ordering::Acquire),
                        Some(AdapterError::connection(self.incomplete_message(false))),
                    ),
                };
                if let Some(err) = &error {
                    warn!("Write to backend {} failed: {}", backend, err);
                }
                BackendWriteOutcome {
                    backend,
                    rows,
                    written,
                    error,
                }
            })
            .collect();
        outcomes.sort_by(|a, b| a.backend.cmp(&b.backend));
        WriteReport { outcomes }
    }
}
