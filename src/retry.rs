//! Tick-driven timeout scheduler. One [`TickScheduler`] task can serve any number of
//!  sessions: firing a task never touches session state, it only posts the task back onto
//!  the owning session's queue. Cancellation is advisory - a cancelled task stays in the
//!  agenda until its deadline and is discarded when it comes due, since removing it would
//!  race with a concurrent tick. Consumers must treat a fired-but-cancelled task as a
//!  no-op as well, because cancellation can happen while the firing is already in flight.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// One scheduled unit of work, attempt-counted across reschedules of the same phase.
pub struct TimeoutTask<K> {
    kind: K,
    attempts_used: AtomicU32,
    cancelled: AtomicBool,
    notify: mpsc::UnboundedSender<Arc<TimeoutTask<K>>>,
}

impl<K: Copy> TimeoutTask<K> {
    pub fn new(kind: K, notify: mpsc::UnboundedSender<Arc<TimeoutTask<K>>>) -> Arc<TimeoutTask<K>> {
        Arc::new(TimeoutTask {
            kind,
            attempts_used: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            notify,
        })
    }

    pub fn kind(&self) -> K {
        self.kind
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used.load(Ordering::Acquire)
    }

    pub fn bump_attempts(&self) {
        self.attempts_used.fetch_add(1, Ordering::AcqRel);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Scheduled<K> {
    fire_at: Instant,
    seq: u64,
    task: Arc<TimeoutTask<K>>,
}

impl<K> PartialEq for Scheduled<K> {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}
impl<K> Eq for Scheduled<K> {}
impl<K> PartialOrd for Scheduled<K> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl<K> Ord for Scheduled<K> {
    // reversed so that the BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then(other.seq.cmp(&self.seq))
    }
}

struct ScheduleRequest<K> {
    fire_at: Instant,
    task: Arc<TimeoutTask<K>>,
}

/// Handle to a spawned tick loop. Cloneable and cheap to share; the loop terminates once
///  all handles are dropped and the agenda has drained its senders.
#[derive(Clone)]
pub struct TickScheduler<K> {
    tx: mpsc::UnboundedSender<ScheduleRequest<K>>,
}

impl<K: Copy + Send + Sync + 'static> TickScheduler<K> {
    /// Spawns the tick loop onto the current tokio runtime.
    pub fn spawn(tick_interval: Duration) -> TickScheduler<K> {
        let tick_interval = tick_interval.max(MIN_TICK_INTERVAL);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(tick_loop(tick_interval, rx));
        TickScheduler { tx }
    }

    pub fn schedule(&self, task: &Arc<TimeoutTask<K>>, delay: Duration) {
        let request = ScheduleRequest {
            fire_at: Instant::now() + delay,
            task: task.clone(),
        };
        if self.tx.send(request).is_err() {
            debug!("scheduling on a terminated tick loop - discarding");
        }
    }
}

async fn tick_loop<K: Copy + Send + Sync + 'static>(
    tick_interval: Duration,
    mut rx: mpsc::UnboundedReceiver<ScheduleRequest<K>>,
) {
    let mut agenda: BinaryHeap<Scheduled<K>> = BinaryHeap::new();
    let mut next_seq = 0u64;
    let mut interval = time::interval(tick_interval);

    loop {
        tokio::select! {
            request = rx.recv() => {
                match request {
                    Some(request) => {
                        agenda.push(Scheduled {
                            fire_at: request.fire_at,
                            seq: next_seq,
                            task: request.task,
                        });
                        next_seq += 1;
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                let now = Instant::now();
                while agenda.peek().map(|next| next.fire_at <= now).unwrap_or(false) {
                    let Some(due) = agenda.pop() else { break };
                    if due.task.is_cancelled() {
                        trace!("discarding cancelled timeout task");
                        continue;
                    }
                    if due.task.notify.send(due.task.clone()).is_err() {
                        debug!("timeout task fired for a dropped session - discarding");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::runtime::Builder;

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_task_fires_after_delay() {
        paused_runtime().block_on(async {
            let scheduler: TickScheduler<u8> = TickScheduler::spawn(Duration::from_millis(50));
            let (tx, mut rx) = mpsc::unbounded_channel();

            let task = TimeoutTask::new(7u8, tx);
            scheduler.schedule(&task, Duration::from_millis(200));

            time::sleep(Duration::from_millis(100)).await;
            assert!(rx.try_recv().is_err());

            time::sleep(Duration::from_millis(200)).await;
            let fired = rx.try_recv().unwrap();
            assert_eq!(fired.kind(), 7);
            assert_eq!(fired.attempts_used(), 0);
        });
    }

    #[test]
    fn test_cancelled_task_does_not_fire() {
        paused_runtime().block_on(async {
            let scheduler: TickScheduler<u8> = TickScheduler::spawn(Duration::from_millis(50));
            let (tx, mut rx) = mpsc::unbounded_channel();

            let task = TimeoutTask::new(1u8, tx);
            scheduler.schedule(&task, Duration::from_millis(200));
            task.cancel();

            time::sleep(Duration::from_millis(500)).await;
            assert!(rx.try_recv().is_err());
        });
    }

    #[test]
    fn test_tasks_fire_in_deadline_order() {
        paused_runtime().block_on(async {
            let scheduler: TickScheduler<u8> = TickScheduler::spawn(Duration::from_millis(50));
            let (tx, mut rx) = mpsc::unbounded_channel();

            let late = TimeoutTask::new(2u8, tx.clone());
            let early = TimeoutTask::new(1u8, tx);
            scheduler.schedule(&late, Duration::from_millis(300));
            scheduler.schedule(&early, Duration::from_millis(100));

            time::sleep(Duration::from_millis(500)).await;
            assert_eq!(rx.try_recv().unwrap().kind(), 1);
            assert_eq!(rx.try_recv().unwrap().kind(), 2);
            assert!(rx.try_recv().is_err());
        });
    }

    #[test]
    fn test_rescheduling_keeps_the_attempt_count() {
        paused_runtime().block_on(async {
            let scheduler: TickScheduler<u8> = TickScheduler::spawn(Duration::from_millis(50));
            let (tx, mut rx) = mpsc::unbounded_channel();

            let task = TimeoutTask::new(1u8, tx);
            scheduler.schedule(&task, Duration::from_millis(100));

            time::sleep(Duration::from_millis(200)).await;
            let fired = rx.try_recv().unwrap();
            fired.bump_attempts();
            scheduler.schedule(&fired, Duration::from_millis(100));

            time::sleep(Duration::from_millis(200)).await;
            assert_eq!(rx.try_recv().unwrap().attempts_used(), 1);
        });
    }
}
