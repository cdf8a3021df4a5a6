//! Concurrent batch fetching.
//!
//! Identifiers are cut into fixed-size batches and each batch becomes one API
//! call on a bounded pool of workers. Results come back in completion order.
//! The first failing batch fails the whole dispatch: batches already in flight
//! are left to finish and their results dropped, batches still waiting for a
//! worker are skipped.

use chrono::NaiveDate;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::api::BatchSource;
use crate::config::DispatchConfig;
use crate::error::{ApiError, DispatchError};
use crate::models::SecurityId;

/// Per-batch result as reported by a worker. `None` means the batch was
/// skipped because a sibling had already failed.
type BatchOutcome<R> = (usize, usize, Option<Result<Vec<R>, ApiError>>);

/// Split `ids` into contiguous batches of at most `batch_size`.
pub fn partition(ids: &[SecurityId], batch_size: usize) -> Vec<Vec<SecurityId>> {
    ids.chunks(batch_size.max(1)).map(<[SecurityId]>::to_vec).collect()
}

/// Fetch every identifier through `source`, `config.batch_size` ids per
/// request and at most `config.workers` requests at a time.
pub async fn fetch_all<S: BatchSource>(
    source: Arc<S>,
    ids: &[SecurityId],
    as_of: NaiveDate,
    config: &DispatchConfig,
) -> Result<Vec<S::Record>, DispatchError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let started = Instant::now();
    let batches = partition(ids, config.batch_size);
    let total = batches.len();
    info!(
        "Starting {} API calls: {} ids in {} batches, {} workers",
        source.name(),
        ids.len(),
        total,
        config.workers
    );

    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let aborted = Arc::new(AtomicBool::new(false));

    let mut workers = FuturesUnordered::new();
    for (index, batch) in batches.into_iter().enumerate() {
        let source = Arc::clone(&source);
        let semaphore = Arc::clone(&semaphore);
        let aborted = Arc::clone(&aborted);

        workers.push(tokio::spawn(async move {
            let size = batch.len();
            let Ok(_permit) = semaphore.acquire().await else {
                return (index, size, None);
            };
            if aborted.load(Ordering::SeqCst) {
                return (index, size, None);
            }

            let result = source.fetch_batch(&batch, as_of).await;
            if result.is_err() {
                aborted.store(true, Ordering::SeqCst);
            }
            (index, size, Some(result))
        }));
    }

    let mut records = Vec::new();
    let mut completed = 0usize;
    while let Some(joined) = workers.next().await {
        let (index, size, outcome): BatchOutcome<S::Record> = joined?;
        match outcome {
            Some(Ok(batch_records)) => {
                completed += 1;
                debug!(
                    "{} batch {}/{} done: {} ids -> {} records ({} of {} complete)",
                    source.name(),
                    index + 1,
                    total,
                    size,
                    batch_records.len(),
                    completed,
                    total
                );
                records.extend(batch_records);
            }
            Some(Err(source_error)) => {
                warn!(
                    "An error occurred during concurrent execution of {} API (batch {}/{}): {}",
                    source.name(),
                    index + 1,
                    total,
                    source_error
                );
                return Err(DispatchError::Batch {
                    batch: index + 1,
                    total,
                    size,
                    source: source_error,
                });
            }
            None => debug!("{} batch {}/{} skipped", source.name(), index + 1, total),
        }
    }

    info!(
        "Completed {} API calls: {} records from {} batches in {:.2?}",
        source.name(),
        records.len(),
        total,
        started.elapsed()
    );
    Ok(records)
}
