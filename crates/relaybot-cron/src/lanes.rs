//! Lane-serialized task runner.
//!
//! Each named lane executes at most one task at a time, in FIFO order.
//! Different lanes run concurrently. A task receives a
//! [`CancellationToken`] that fires on timeout or explicit cancel; the
//! task future itself is dropped at that point, so anything it owns
//! (child processes spawned with `kill_on_drop`) goes with it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::LaneError;

/// Lane shared by live inbound traffic and main-session cron payloads.
pub const MAIN_LANE: &str = "main";

pub type TaskId = u64;

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Measured from the moment the lane starts executing the task.
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Per-lane counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneStats {
    pub lane: String,
    pub queued: usize,
    pub active: usize,
    pub total_processed: u64,
}

struct Pending {
    id: TaskId,
    go: oneshot::Sender<()>,
    cancel: CancellationToken,
}

struct Running {
    id: TaskId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<Pending>,
    active: Option<Running>,
    total_processed: u64,
}

#[derive(Default)]
struct Inner {
    lanes: HashMap<String, LaneState>,
    next_id: TaskId,
}

/// Handle to an enqueued task.
pub struct LaneHandle<T> {
    id: TaskId,
    rx: oneshot::Receiver<Result<T, LaneError>>,
}

impl<T> LaneHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Wait for the task's result.
    pub async fn join(self) -> Result<T, LaneError> {
        self.rx.await.unwrap_or(Err(LaneError::Closed))
    }
}

#[derive(Clone, Default)]
pub struct CommandLanes {
    inner: Arc<Mutex<Inner>>,
}

impl CommandLanes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `task` on `lane`. It starts once every earlier task on the same
    /// lane has finished.
    pub fn enqueue<F, Fut, T>(&self, lane: &str, opts: EnqueueOptions, task: F) -> LaneHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (go_tx, go_rx) = oneshot::channel();
        let (res_tx, res_rx) = oneshot::channel();

        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            let state = inner.lanes.entry(lane.to_string()).or_default();
            if state.active.is_none() {
                state.active = Some(Running {
                    id,
                    cancel: cancel.clone(),
                });
                let _ = go_tx.send(());
            } else {
                tracing::debug!(lane = %lane, task_id = id, queued = state.queue.len() + 1, "lane busy, queueing");
                state.queue.push_back(Pending {
                    id,
                    go: go_tx,
                    cancel: cancel.clone(),
                });
            }
            id
        };

        let lanes = self.clone();
        let lane = lane.to_string();
        tokio::spawn(async move {
            let started = tokio::select! {
                go = go_rx => go.is_ok(),
                _ = cancel.cancelled() => false,
            };

            let result = if !started {
                Err(LaneError::Cancelled)
            } else {
                let fut = task(cancel.clone());
                match opts.timeout {
                    Some(limit) => tokio::select! {
                        value = fut => Ok(value),
                        _ = cancel.cancelled() => Err(LaneError::Cancelled),
                        _ = tokio::time::sleep(limit) => {
                            cancel.cancel();
                            tracing::warn!(lane = %lane, task_id = id, "lane task timed out after {}ms", limit.as_millis());
                            Err(LaneError::Timeout(limit))
                        }
                    },
                    None => tokio::select! {
                        value = fut => Ok(value),
                        _ = cancel.cancelled() => Err(LaneError::Cancelled),
                    },
                }
            };

            lanes.finish(&lane, id);
            let _ = res_tx.send(result);
        });

        LaneHandle { id, rx: res_rx }
    }

    /// Enqueue and wait.
    pub async fn run<F, Fut, T>(&self, lane: &str, opts: EnqueueOptions, task: F) -> Result<T, LaneError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(lane, opts, task).join().await
    }

    /// Release the lane slot held by `id` (or drop it from the queue) and
    /// start the next queued task.
    fn finish(&self, lane: &str, id: TaskId) {
        let mut inner = self.lock();
        let Some(state) = inner.lanes.get_mut(lane) else {
            return;
        };
        if !state.active.as_ref().is_some_and(|r| r.id == id) {
            state.queue.retain(|p| p.id != id);
            return;
        }
        state.active = None;
        state.total_processed += 1;
        while let Some(Pending { id, go, cancel }) = state.queue.pop_front() {
            if go.send(()).is_ok() {
                state.active = Some(Running { id, cancel });
                break;
            }
        }
    }

    /// Cancel a queued or running task. Returns false if `id` is unknown
    /// or already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut inner = self.lock();
        for state in inner.lanes.values_mut() {
            if let Some(pos) = state.queue.iter().position(|p| p.id == id) {
                if let Some(pending) = state.queue.remove(pos) {
                    pending.cancel.cancel();
                }
                return true;
            }
            if let Some(running) = state.active.as_ref().filter(|r| r.id == id) {
                running.cancel.cancel();
                return true;
            }
        }
        false
    }

    /// Counters for every lane seen so far, sorted by name.
    pub fn stats(&self) -> Vec<LaneStats> {
        let inner = self.lock();
        let mut stats: Vec<LaneStats> = inner
            .lanes
            .iter()
            .map(|(name, state)| LaneStats {
                lane: name.clone(),
                queued: state.queue.len(),
                active: usize::from(state.active.is_some()),
                total_processed: state.total_processed,
            })
            .collect();
        stats.sort_by(|a, b| a.lane.cmp(&b.lane));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tracks how many tasks are inside a critical section at once.
    #[derive(Default)]
    struct Overlap {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl Overlap {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_lane_never_overlaps() {
        let lanes = CommandLanes::new();
        let overlap = Arc::new(Overlap::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let overlap = overlap.clone();
                let order = order.clone();
                lanes.enqueue("main", EnqueueOptions::default(), move |_| async move {
                    overlap.enter();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order.lock().unwrap().push(i);
                    overlap.exit();
                    i
                })
            })
            .collect();

        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().await, Ok(i));
        }
        assert_eq!(overlap.max.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_lanes_run_concurrently() {
        let lanes = CommandLanes::new();
        let overlap = Arc::new(Overlap::default());

        let mut handles = Vec::new();
        for lane in ["main", "cron"] {
            let overlap = overlap.clone();
            handles.push(lanes.enqueue(lane, EnqueueOptions::default(), move |_| async move {
                overlap.enter();
                tokio::time::sleep(Duration::from_millis(50)).await;
                overlap.exit();
            }));
        }
        for h in handles {
            h.join().await.unwrap();
        }
        assert_eq!(overlap.max.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_token_and_frees_lane() {
        let lanes = CommandLanes::new();
        let (saw_cancel_tx, saw_cancel_rx) = oneshot::channel();

        let slow = lanes.enqueue(
            "cron",
            EnqueueOptions::with_timeout(Duration::from_secs(1)),
            move |token| async move {
                tokio::spawn(async move {
                    token.cancelled().await;
                    let _ = saw_cancel_tx.send(());
                });
                tokio::time::sleep(Duration::from_secs(60)).await;
            },
        );
        let next = lanes.enqueue("cron", EnqueueOptions::default(), |_| async { "after" });

        assert_eq!(slow.join().await, Err(LaneError::Timeout(Duration::from_secs(1))));
        assert_eq!(next.join().await, Ok("after"));
        assert!(saw_cancel_rx.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_measured_from_lane_start() {
        let lanes = CommandLanes::new();
        let first = lanes.enqueue("main", EnqueueOptions::default(), |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        // would time out if the clock started at enqueue time
        let second = lanes.enqueue(
            "main",
            EnqueueOptions::with_timeout(Duration::from_secs(2)),
            |_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                7
            },
        );
        first.join().await.unwrap();
        assert_eq!(second.join().await, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_queued_task_has_no_side_effects() {
        let lanes = CommandLanes::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = lanes.enqueue("main", EnqueueOptions::default(), |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        let counter = ran.clone();
        let victim = lanes.enqueue("main", EnqueueOptions::default(), move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = ran.clone();
        let survivor = lanes.enqueue("main", EnqueueOptions::default(), move |_| async move {
            counter.fetch_add(10, Ordering::SeqCst);
        });

        assert!(lanes.cancel(victim.id()));
        assert_eq!(victim.join().await, Err(LaneError::Cancelled));
        blocker.join().await.unwrap();
        survivor.join().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_running_task() {
        let lanes = CommandLanes::new();
        let running = lanes.enqueue("cron", EnqueueOptions::default(), |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tokio::task::yield_now().await;
        assert!(lanes.cancel(running.id()));
        assert_eq!(running.join().await, Err(LaneError::Cancelled));
        assert!(!lanes.cancel(12345));

        let after = lanes.run("cron", EnqueueOptions::default(), |_| async { 1 }).await;
        assert_eq!(after, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let lanes = CommandLanes::new();
        let first = lanes.enqueue("main", EnqueueOptions::default(), |_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        let second = lanes.enqueue("main", EnqueueOptions::default(), |_| async {});

        let stats = lanes.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].active, 1);
        assert_eq!(stats[0].queued, 1);

        first.join().await.unwrap();
        second.join().await.unwrap();
        lanes.run("cron", EnqueueOptions::default(), |_| async {}).await.unwrap();

        let stats = lanes.stats();
        assert_eq!(
            stats,
            vec![
                LaneStats { lane: "cron".into(), queued: 0, active: 0, total_processed: 1 },
                LaneStats { lane: "main".into(), queued: 0, active: 0, total_processed: 2 },
            ]
        );
    }
}
