//! The review worker pool draining a real job queue over the in-memory broker.

use api_lib::broker::MemoryBroker;
use api_lib::config::BrokerSettings;
use api_lib::consumer::WorkerPool;
use api_lib::queue::{BrokerJobQueue, REVIEW_QUEUE};
use api_lib::scenario::ReviewService;
use async_trait::async_trait;
use interview_core::domain::InterviewId;
use interview_core::ports::{JobQueue, PortResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Panics the first time it sees interview 13.
#[derive(Default)]
struct FlakyReviewer {
    panicked: AtomicBool,
    active: AtomicUsize,
    max_active: AtomicUsize,
    reviewed: Mutex<Vec<InterviewId>>,
}

impl FlakyReviewer {
    fn reviewed(&self) -> Vec<InterviewId> {
        let mut reviewed = self.reviewed.lock().unwrap().clone();
        reviewed.sort_unstable();
        reviewed
    }
}

#[async_trait]
impl ReviewService for FlakyReviewer {
    async fn review_performance(&self, interview_id: InterviewId) -> PortResult<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        sleep(Duration::from_millis(50)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if interview_id == 13 && !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("reviewer crashed on interview {}", interview_id);
        }
        self.reviewed.lock().unwrap().push(interview_id);
        Ok(())
    }
}

fn settings() -> BrokerSettings {
    BrokerSettings { host: "memory".to_string(), ..BrokerSettings::default() }
}

async fn wait_for(reviewer: &FlakyReviewer, count: usize) {
    timeout(Duration::from_secs(120), async {
        while reviewer.reviewed().len() < count {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("jobs were not reviewed in time");
}

#[tokio::test(start_paused = true)]
async fn a_panicking_job_is_requeued_and_the_pool_keeps_going() {
    let broker = MemoryBroker::new();
    let queue = BrokerJobQueue::connect(broker.clone(), settings());
    for interview_id in [1, 13, 2, 3] {
        let body = format!(r#"{{"interview_id":{}}}"#, interview_id);
        queue.push(body.as_bytes(), REVIEW_QUEUE).await.unwrap();
    }

    let reviewer = Arc::new(FlakyReviewer::default());
    let cancel = CancellationToken::new();
    let deliveries = queue.start_consuming(cancel.child_token(), REVIEW_QUEUE).await.unwrap();
    let pool = WorkerPool::new(3, reviewer.clone()).start(deliveries, cancel.child_token());

    wait_for(&reviewer, 4).await;
    assert_eq!(reviewer.reviewed(), vec![1, 2, 3, 13]);
    assert!(reviewer.panicked.load(Ordering::SeqCst));

    let stats = broker.stats();
    assert_eq!(stats.nacks, 1);
    assert_eq!(stats.acks, 4);
    assert_eq!(broker.in_flight(), 0);
    // No worker was lost to the panic.
    assert_eq!(pool.len(), 3);

    pool.shutdown().await;
    cancel.cancel();
    queue.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn workers_never_hold_two_deliveries_at_once() {
    let broker = MemoryBroker::new();
    let queue = BrokerJobQueue::connect(broker.clone(), settings());
    for interview_id in 1..=12u64 {
        let body = format!(r#"{{"interview_id":{}}}"#, interview_id);
        queue.push(body.as_bytes(), REVIEW_QUEUE).await.unwrap();
    }

    let reviewer = Arc::new(FlakyReviewer::default());
    let cancel = CancellationToken::new();
    let deliveries = queue.start_consuming(cancel.child_token(), REVIEW_QUEUE).await.unwrap();
    let pool = WorkerPool::new(4, reviewer.clone()).start(deliveries, cancel.child_token());

    wait_for(&reviewer, 12).await;
    assert_eq!(reviewer.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(broker.stats().max_in_flight, 1);
    assert_eq!(broker.stats().prefetch, Some(1));

    cancel.cancel();
    pool.join().await;
    queue.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn malformed_jobs_are_requeued_without_a_ceiling() {
    let broker = MemoryBroker::new();
    let queue = BrokerJobQueue::connect(broker.clone(), settings());
    let reviewer = Arc::new(FlakyReviewer::default());
    let cancel = CancellationToken::new();
    let deliveries = queue.start_consuming(cancel.child_token(), REVIEW_QUEUE).await.unwrap();
    let pool = WorkerPool::new(2, reviewer.clone()).start(deliveries, cancel.child_token());

    broker.enqueue(REVIEW_QUEUE, &b"not a job"[..]);
    while broker.stats().nacks < 3 {
        tokio::task::yield_now().await;
    }
    assert!(reviewer.reviewed().is_empty());
    assert_eq!(pool.len(), 2);

    pool.shutdown().await;
    // The poison message is still on the queue or on its way back.
    assert_eq!(broker.queue_len(REVIEW_QUEUE) + broker.in_flight(), 1);
    cancel.cancel();
    queue.close().await.unwrap();
}
