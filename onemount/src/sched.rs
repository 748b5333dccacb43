//! Prioritized metadata request scheduler.
//!
//! Two bounded queues feed a small worker pool. Requests are
//! deduplicated by cache key: a duplicate joins the in-flight
//! request's waiter list, and a higher-priority duplicate promotes the
//! queued one. With two or more workers, one is reserved for the high
//! queue and only steals from low when high is empty; the others check
//! high first after finishing every item so background floods cannot
//! starve foreground lookups.

use crate::{
    remote::{DriveItem, Remote},
    Error, ItemId, Result,
};
use parking_lot::RwLock;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum Priority {
    Low,
    High,
}

/// Cache key of a metadata fetch.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Request {
    Children(ItemId),
    Item(ItemId),
    Path(String),
}

#[derive(Debug)]
pub enum Fetched {
    Item(DriveItem),
    Children(Vec<DriveItem>),
}

/// Results are shared between joined waiters, so errors travel in an
/// `Arc` too.
pub type SchedResult = std::result::Result<Arc<Fetched>, Arc<Error>>;

/// Sink applying fetched metadata into the inode graph.
pub type ApplySink = Arc<dyn Fn(&Request, &Fetched) + Send + Sync>;

struct Pending {
    priority: Priority,
    claimed: bool,
    enqueued: Instant,
    waiters: Vec<flume::Sender<SchedResult>>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStats {
    pub high_depth: usize,
    pub low_depth: usize,
    pub avg_wait_ms: u64,
}

pub struct MetadataScheduler {
    high_tx: flume::Sender<Request>,
    high_rx: flume::Receiver<Request>,
    low_tx: flume::Sender<Request>,
    low_rx: flume::Receiver<Request>,
    pending: scc::HashMap<Request, Pending>,
    remote: Arc<dyn Remote>,
    apply: RwLock<Option<ApplySink>>,
    request_timeout: Duration,
    wait_sum_ms: AtomicU64,
    completed: AtomicU64,
}

impl MetadataScheduler {
    pub fn new(
        remote: Arc<dyn Remote>,
        workers: usize,
        high_cap: usize,
        low_cap: usize,
        request_timeout: Duration,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> Arc<Self> {
        let (high_tx, high_rx) = flume::bounded(high_cap);
        let (low_tx, low_rx) = flume::bounded(low_cap);

        let scheduler = Arc::new(MetadataScheduler {
            high_tx,
            high_rx,
            low_tx,
            low_rx,
            pending: scc::HashMap::new(),
            remote,
            apply: RwLock::new(None),
            request_timeout,
            wait_sum_ms: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        for i in 0..workers {
            let reserved = i == 0 && workers >= 2;
            let this = scheduler.clone();
            let cancel = cancel.clone();
            tracker.spawn(async move { this.worker(reserved, cancel).await });
        }

        scheduler
    }

    pub fn set_apply(&self, sink: ApplySink) {
        *self.apply.write() = Some(sink);
    }

    /// Enqueue a request, joining any in-flight duplicate. The
    /// returned channel yields exactly one result. `QueueFull` means
    /// the caller must fall back to a direct call.
    pub fn submit(&self, request: Request, priority: Priority) -> Result<flume::Receiver<SchedResult>> {
        let (tx, rx) = flume::bounded(1);

        let mut joined = false;
        let mut promote = false;
        self.pending
            .entry(request.clone())
            .and_modify(|p| {
                joined = true;
                p.waiters.push(tx.clone());
                if priority > p.priority && !p.claimed {
                    p.priority = priority;
                    promote = true;
                }
            })
            .or_insert_with(|| Pending {
                priority,
                claimed: false,
                enqueued: Instant::now(),
                waiters: vec![tx],
            });

        if joined {
            if promote {
                // the original entry stays in the low queue; workers
                // skip whichever copy loses the claim race
                let _ = self.high_tx.try_send(request);
            }
            return Ok(rx);
        }

        let queue = match priority {
            Priority::High => &self.high_tx,
            Priority::Low => &self.low_tx,
        };
        if queue.try_send(request.clone()).is_err() {
            self.pending.remove(&request);
            return Err(Error::QueueFull);
        }
        Ok(rx)
    }

    /// Submit and wait. Foreground requests inherit the configured
    /// deadline; expiry surfaces as a transient network error.
    pub async fn request(&self, request: Request, priority: Priority) -> Result<Arc<Fetched>> {
        let rx = self.submit(request, priority)?;
        let outcome = tokio::time::timeout(self.request_timeout, rx.recv_async()).await?;
        match outcome {
            Ok(Ok(fetched)) => Ok(fetched),
            Ok(Err(e)) => Err(Error::network(format!("metadata fetch failed: {}", e))),
            Err(_) => Err(Error::network("metadata scheduler dropped request")),
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let completed = self.completed.load(Ordering::Relaxed);
        SchedulerStats {
            high_depth: self.high_tx.len(),
            low_depth: self.low_tx.len(),
            avg_wait_ms: if completed == 0 {
                0
            } else {
                self.wait_sum_ms.load(Ordering::Relaxed) / completed
            },
        }
    }

    async fn worker(self: Arc<Self>, reserved: bool, cancel: CancellationToken) {
        loop {
            let request = if reserved {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    r = self.high_rx.recv_async() => r,
                    r = self.low_rx.recv_async() => r,
                }
            } else {
                // anti-starvation: check high before settling on low
                match self.high_rx.try_recv() {
                    Ok(r) => Ok(r),
                    Err(_) => tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.high_rx.recv_async() => r,
                        r = self.low_rx.recv_async() => r,
                    },
                }
            };
            let request = match request {
                Ok(r) => r,
                Err(_) => break,
            };
            self.process(request).await;
        }
    }

    async fn process(&self, request: Request) {
        // claim; a duplicate queue entry for an already-claimed or
        // already-finished key is skipped
        let wait = self.pending.update(&request, |_, p| {
            if p.claimed {
                None
            } else {
                p.claimed = true;
                Some(p.enqueued.elapsed())
            }
        });
        let wait = match wait.flatten() {
            Some(w) => w,
            None => return,
        };
        self.wait_sum_ms
            .fetch_add(wait.as_millis() as u64, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let result = tokio::time::timeout(self.request_timeout, self.fetch(&request)).await;
        let result: SchedResult = match result {
            Ok(Ok(fetched)) => {
                let apply = self.apply.read().clone();
                if let Some(apply) = apply {
                    apply(&request, &fetched);
                }
                Ok(Arc::new(fetched))
            }
            Ok(Err(e)) => {
                warn!(request = ?request, err = %e, "metadata fetch failed");
                Err(Arc::new(e))
            }
            Err(elapsed) => Err(Arc::new(elapsed.into())),
        };
        debug!(
            request = ?request,
            wait_ms = wait.as_millis() as u64,
            duration_ms = started.elapsed().as_millis() as u64,
            "metadata request done"
        );

        if let Some((_, pending)) = self.pending.remove(&request) {
            for waiter in pending.waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    async fn fetch(&self, request: &Request) -> Result<Fetched> {
        match request {
            Request::Children(id) => self.remote.children(id).await.map(Fetched::Children),
            Request::Item(id) => self.remote.item(id).await.map(Fetched::Item),
            Request::Path(path) => self.remote.item_by_path(path).await.map(Fetched::Item),
        }
    }
}
