use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Semaphore, oneshot};
use tracing::{debug, warn};

use crate::dither::DitherError;
use crate::message::{DitherRequest, DitherResponse};

pub type WorkerReply = Result<DitherResponse, DitherError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Dither(#[from] DitherError),
    #[error("dither job {0} ended without a reply")]
    Aborted(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
}

/// Runs dither jobs off the async executor.
///
/// Each job owns its buffers and produces exactly one reply. Jobs are never
/// cancelled: a caller that stops listening simply misses the reply.
pub struct DitherWorker {
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    stats: Arc<Mutex<WorkerStats>>,
}

impl DitherWorker {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            next_id: AtomicU64::new(1),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    /// Dispatch one request. The receiver resolves once with the job's result.
    pub fn submit(&self, request: DitherRequest) -> (u64, oneshot::Receiver<WorkerReply>) {
        let job = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.stats.lock().submitted += 1;
        let permits = Arc::clone(&self.permits);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            // The semaphore is never closed, so acquire only fails if that changes.
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(job, "worker semaphore closed; dropping job");
                return;
            };
            stats.lock().in_flight += 1;
            let started = Instant::now();
            let (w, h) = (request.image_data.width, request.image_data.height);
            let pixel_size = request.pixel_size;
            let result = tokio::task::spawn_blocking(move || request.process()).await;
            {
                let mut s = stats.lock();
                s.in_flight -= 1;
                match &result {
                    Ok(Ok(_)) => s.completed += 1,
                    _ => s.failed += 1,
                }
            }
            let reply = match result {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(job, error = %e, "dither job panicked");
                    return;
                }
            };
            match &reply {
                Ok(_) => debug!(
                    job,
                    width = w,
                    height = h,
                    pixel_size,
                    elapsed_ms = started.elapsed().as_millis(),
                    "dither job done"
                ),
                Err(e) => debug!(job, error = %e, "dither job rejected"),
            }
            if tx.send(reply).is_err() {
                debug!(job, "caller went away; discarding late reply");
            }
        });
        (job, rx)
    }

    /// Submit and wait for the reply.
    pub async fn run(&self, request: DitherRequest) -> Result<DitherResponse, WorkerError> {
        let (job, rx) = self.submit(request);
        let reply = rx.await.map_err(|_| WorkerError::Aborted(job))?;
        Ok(reply?)
    }

    pub fn stats(&self) -> WorkerStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dither::{DitherParams, OPAQUE_BLACK, OPAQUE_WHITE, RasterImage};

    fn request(size: u32, pixel_size: i32) -> DitherRequest {
        DitherRequest::new(
            RasterImage::filled(size, size, [120, 130, 140, 255]),
            DitherParams {
                pixel_size,
                ..DitherParams::default()
            },
        )
    }

    #[tokio::test]
    async fn run_returns_echoed_parameters() {
        let worker = DitherWorker::new(2);
        let resp = worker.run(request(4, 3)).await.unwrap();
        assert_eq!(resp.pixel_size, 3);
        assert_eq!(resp.cutoff, 0.5);
        assert_eq!((resp.image_data.width, resp.image_data.height), (12, 12));
        for px in resp.image_data.data.chunks_exact(4) {
            assert!(px == &OPAQUE_BLACK[..] || px == &OPAQUE_WHITE[..]);
        }
    }

    #[tokio::test]
    async fn engine_errors_come_back_as_replies() {
        let worker = DitherWorker::new(1);
        let err = worker.run(request(2, -1)).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Dither(DitherError::InvalidParameter(_))
        ));
        let stats = worker.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn concurrent_jobs_are_independent() {
        let worker = DitherWorker::new(2);
        let receivers: Vec<_> = (1..=6).map(|s| worker.submit(request(s, s as i32))).collect();
        let mut ids = Vec::new();
        for (job, rx) in receivers {
            ids.push(job);
            let resp = rx.await.unwrap().unwrap();
            let side = resp.pixel_size as u32;
            assert_eq!(resp.image_data.width, side * side);
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 6);
        let stats = worker.stats();
        assert_eq!(stats.submitted, 6);
        assert_eq!(stats.completed, 6);
    }

    #[tokio::test]
    async fn dropped_receiver_still_completes() {
        let worker = DitherWorker::new(1);
        let (_, rx) = worker.submit(request(8, 2));
        drop(rx);
        worker.run(request(1, 1)).await.unwrap();
        for _ in 0..100_000 {
            if worker.stats().completed == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        let stats = worker.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.submitted, 2);
    }
}
