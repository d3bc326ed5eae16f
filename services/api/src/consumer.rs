//! services/api/src/consumer.rs
//!
//! A fixed-size pool of workers draining review jobs from one delivery stream.
//!
//! Every delivery is settled exactly once: acknowledged when the review was
//! stored, negatively acknowledged with requeue on any failure, panics included.
//! A failing job never takes its worker down, so the pool does not shrink.

use futures::StreamExt;
use interview_core::domain::{InterviewId, ReviewJob};
use interview_core::ports::{Delivery, DeliveryStream, PortError};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::recover::{catch_panic, Panicked};
use crate::scenario::ReviewService;

/// Why a review job could not be completed.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("malformed review job: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("review failed: {0}")]
    Review(#[from] PortError),
    #[error("review job {0}")]
    Panicked(#[from] Panicked),
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    /// The broker did not accept the acknowledgement; it redelivers once the
    /// channel closes.
    Unsettled,
}

pub struct WorkerPool {
    size: usize,
    review: Arc<dyn ReviewService>,
}

impl WorkerPool {
    pub fn new(size: usize, review: Arc<dyn ReviewService>) -> Self {
        Self { size: size.max(1), review }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawns the workers. They share `deliveries` and stop when `cancel` fires
    /// or the stream ends.
    pub fn start(&self, deliveries: DeliveryStream, cancel: CancellationToken) -> WorkerPoolHandle {
        let deliveries = Arc::new(Mutex::new(deliveries));
        let mut workers = JoinSet::new();
        for worker_id in 0..self.size {
            workers.spawn(run_worker(
                worker_id,
                deliveries.clone(),
                self.review.clone(),
                cancel.clone(),
            ));
        }
        info!(workers = self.size, "worker pool started");
        WorkerPoolHandle { cancel, workers }
    }
}

pub struct WorkerPoolHandle {
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl WorkerPoolHandle {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for every worker to finish its current job and exit.
    pub async fn join(mut self) {
        while let Some(joined) = self.workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task failed");
            }
        }
        info!("worker pool stopped");
    }

    pub async fn shutdown(self) {
        self.cancel();
        self.join().await;
    }
}

async fn run_worker(
    worker_id: usize,
    deliveries: Arc<Mutex<DeliveryStream>>,
    review: Arc<dyn ReviewService>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                stream = deliveries.lock() => stream,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            }
        };
        let Some(delivery) = next else {
            info!(worker_id, "delivery stream ended");
            break;
        };
        process_delivery(worker_id, delivery, review.as_ref()).await;
    }
    info!(worker_id, "worker stopped");
}

async fn run_job(body: &[u8], review: &dyn ReviewService) -> Result<InterviewId, JobError> {
    let job: ReviewJob = serde_json::from_slice(body)?;
    review.review_performance(job.interview_id).await?;
    Ok(job.interview_id)
}

/// Runs one review job behind a panic boundary and settles its delivery.
pub async fn process_delivery(
    worker_id: usize,
    delivery: Delivery,
    review: &dyn ReviewService,
) -> Settlement {
    let outcome = match catch_panic(run_job(&delivery.body, review)).await {
        Ok(result) => result,
        Err(panicked) => Err(JobError::from(panicked)),
    };

    match outcome {
        Ok(interview_id) => match delivery.ack().await {
            Ok(()) => {
                info!(worker_id, interview_id, "review job completed");
                Settlement::Acked
            }
            Err(err) => {
                warn!(worker_id, interview_id, error = %err, "failed to ack review job");
                Settlement::Unsettled
            }
        },
        Err(err) => {
            // No redelivery ceiling: a job that always fails is requeued forever.
            error!(worker_id, error = %err, "review job failed, requeueing");
            match delivery.nack(true).await {
                Ok(()) => Settlement::Requeued,
                Err(err) => {
                    warn!(worker_id, error = %err, "failed to nack review job");
                    Settlement::Unsettled
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use interview_core::ports::{Acknowledger, PortResult};
    use std::sync::Mutex as StdMutex;

    #[derive(Clone, Default)]
    struct Log(Arc<StdMutex<Vec<String>>>);

    impl Log {
        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Acknowledger for Log {
        async fn ack(&self) -> PortResult<()> {
            self.0.lock().unwrap().push("ack".to_string());
            Ok(())
        }
        async fn nack(&self, requeue: bool) -> PortResult<()> {
            self.0.lock().unwrap().push(format!("nack requeue={}", requeue));
            Ok(())
        }
        async fn reject(&self, requeue: bool) -> PortResult<()> {
            self.0.lock().unwrap().push(format!("reject requeue={}", requeue));
            Ok(())
        }
    }

    /// Panics on interview 13, fails on interview 7, succeeds otherwise.
    struct Reviewer;

    #[async_trait]
    impl ReviewService for Reviewer {
        async fn review_performance(&self, interview_id: InterviewId) -> PortResult<()> {
            match interview_id {
                13 => panic!("reviewer crashed"),
                7 => Err(PortError::Unavailable("model down".to_string())),
                _ => Ok(()),
            }
        }
    }

    fn delivery(body: &'static str, log: &Log) -> Delivery {
        Delivery::new(Bytes::from_static(body.as_bytes()), Box::new(log.clone()))
    }

    #[tokio::test]
    async fn successful_reviews_are_acked() {
        let log = Log::default();
        let settled = process_delivery(0, delivery(r#"{"interview_id":1}"#, &log), &Reviewer).await;
        assert_eq!(settled, Settlement::Acked);
        assert_eq!(log.entries(), vec!["ack"]);
    }

    #[tokio::test]
    async fn failures_are_requeued_exactly_once() {
        for body in [r#"{"interview_id":7}"#, r#"{"interview_id":13}"#, "not json"] {
            let log = Log::default();
            let settled = process_delivery(3, delivery(body, &log), &Reviewer).await;
            assert_eq!(settled, Settlement::Requeued, "body {}", body);
            assert_eq!(log.entries(), vec!["nack requeue=true"]);
        }
    }

    #[tokio::test]
    async fn pool_drains_a_shared_stream() {
        let log = Log::default();
        let items: Vec<Delivery> = [r#"{"interview_id":1}"#, r#"{"interview_id":13}"#, r#"{"interview_id":2}"#]
            .into_iter()
            .map(|body| delivery(body, &log))
            .collect();
        let deliveries: DeliveryStream = Box::pin(futures::stream::iter(items));

        let pool = WorkerPool::new(2, Arc::new(Reviewer));
        let handle = pool.start(deliveries, CancellationToken::new());
        assert_eq!(handle.len(), 2);
        handle.join().await;

        let mut entries = log.entries();
        entries.sort();
        assert_eq!(entries, vec!["ack", "ack", "nack requeue=true"]);
    }
}
