use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::registry::Callback;
use crate::schedule::Schedule;

/// A live schedule running inside the server (§3 `ScheduleTask`). The
/// `Schedule` is shared by reference between this handle and the
/// cooperative loop so a `list()` snapshot observes `last_run`/`end_on`
/// as the loop updates them (§3 "Ownership").
pub struct ScheduleTask {
    pub name: String,
    schedule: Arc<RwLock<Schedule>>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduleTask {
    /// Spawn the cooperative loop of §4.2 for `schedule`, invoking
    /// `callback` with the captured `args`/`kwargs` on every firing.
    pub fn spawn(
        name: String,
        schedule: Schedule,
        callback: Arc<dyn Callback>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> ScheduleTask {
        let cancel = CancellationToken::new();
        let shared_schedule = Arc::new(RwLock::new(schedule));
        let loop_schedule = shared_schedule.clone();
        let loop_name = name.clone();
        let loop_cancel = cancel.clone();

        let handle = tokio::spawn(run_loop(loop_name, loop_schedule, callback, args, kwargs, loop_cancel));

        ScheduleTask {
            name,
            schedule: shared_schedule,
            cancel,
            handle,
        }
    }

    /// Snapshot the current `Schedule`, including bookkeeping fields the
    /// loop has updated since it started.
    pub async fn schedule_snapshot(&self) -> Schedule {
        self.schedule.read().await.clone()
    }

    /// Cancel the task's loop. §4.2 "Cancellation": signals the
    /// cooperative task so no further callback invocation slips through,
    /// whether it is sleeping or about to fire.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.handle.abort_handle()
    }
}

/// §4.2: the per-schedule cooperative loop.
async fn run_loop(
    name: String,
    schedule: Arc<RwLock<Schedule>>,
    callback: Arc<dyn Callback>,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    cancel: CancellationToken,
) {
    info!(task = %name, "schedule task started");

    loop {
        let now = chrono::Local::now().naive_local();
        let wait_secs = schedule.write().await.run_in(now);
        if wait_secs < 0 {
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!(task = %name, "schedule task cancelled during sleep");
                return;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(wait_secs as u64)) => {}
        }

        if cancel.is_cancelled() {
            info!(task = %name, "schedule task cancelled before firing");
            return;
        }

        let fire_time = chrono::Local::now().naive_local();
        let past_end = {
            let mut guard = schedule.write().await;
            guard.reschedule(fire_time);
            guard.past_end(fire_time)
        };

        match callback.invoke(args.clone(), kwargs.clone()).await {
            Ok(_) => {}
            Err(err) => {
                error!(task = %name, level = "critical", error = %err, "schedule callback failed");
            }
        }

        if past_end {
            break;
        }
    }

    info!(task = %name, "schedule task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SyncCallback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn counting_callback() -> (StdArc<AtomicUsize>, Arc<dyn Callback>) {
        let count = StdArc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let cb: Arc<dyn Callback> = Arc::new(SyncCallback(move |_, _| {
            count_clone.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }));
        (count, cb)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_immediately_for_zero_interval_one_shot() {
        let (count, cb) = counting_callback();
        let now = chrono::Local::now().naive_local();
        let schedule = Schedule {
            start_on: now,
            repeat: false,
            ..Default::default()
        };
        let task = ScheduleTask::spawn("one-shot".into(), schedule, cb, vec![], Map::new());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        task.abort_handle().abort();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(task.schedule_snapshot().await.last_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_sleep_prevents_firing() {
        let (count, cb) = counting_callback();
        let now = chrono::Local::now().naive_local();
        let schedule = Schedule {
            start_on: now,
            seconds: 3600.0,
            repeat: true,
            ..Default::default()
        };
        let task = ScheduleTask::spawn("long-sleep".into(), schedule, cb, vec![], Map::new());
        tokio::task::yield_now().await;
        task.cancel();
        tokio::time::advance(std::time::Duration::from_secs(3601)).await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_until_cancelled() {
        let (count, cb) = counting_callback();
        let now = chrono::Local::now().naive_local();
        let schedule = Schedule {
            start_on: now,
            seconds: 1.0,
            repeat: true,
            ..Default::default()
        };
        let task = ScheduleTask::spawn("repeater".into(), schedule, cb, vec![], Map::new());
        for _ in 0..3 {
            tokio::time::advance(std::time::Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        task.cancel();
        tokio::task::yield_now().await;
        assert!(count.load(Ordering::SeqCst) >= 3);
    }
}
