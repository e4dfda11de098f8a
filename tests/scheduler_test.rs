//! Scheduler behavior: bounded concurrency, FIFO admission, cancellation.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::timeout;

use zmigrate::error::Result;
use zmigrate::store::MemoryStore;
use zmigrate::task::scheduler::{ExecOutcome, Scheduler, TaskExecutor};
use zmigrate::task::{Task, TaskParams, TaskStatus, TaskStore};

fn params(n: usize) -> TaskParams {
    TaskParams {
        source: format!("tank/data{n}@snap"),
        destination: format!("backup/data{n}"),
        remote: None,
        token: None,
        limit_mbps: None,
        compression: None,
        recursive: false,
        sync: true,
        resumable: true,
    }
}

/// Reports each start on a channel, then blocks until a release permit
/// is available.
struct GateExecutor {
    started: mpsc::UnboundedSender<String>,
    release: Arc<Semaphore>,
}

#[async_trait]
impl TaskExecutor for GateExecutor {
    async fn execute(
        &self,
        task: &Task,
        _tasks: TaskStore,
        _cancel: watch::Receiver<bool>,
    ) -> Result<ExecOutcome> {
        let _ = self.started.send(task.id.clone());
        self.release.acquire().await.unwrap().forget();
        Ok(ExecOutcome::Completed)
    }
}

/// Records execution order and completes immediately.
struct RecordingExecutor {
    order: Arc<StdMutex<Vec<String>>>,
}

#[async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(
        &self,
        task: &Task,
        _tasks: TaskStore,
        _cancel: watch::Receiver<bool>,
    ) -> Result<ExecOutcome> {
        self.order.lock().unwrap().push(task.id.clone());
        Ok(ExecOutcome::Completed)
    }
}

/// Runs until the cancellation flag flips.
struct UntilCancelledExecutor;

#[async_trait]
impl TaskExecutor for UntilCancelledExecutor {
    async fn execute(
        &self,
        _task: &Task,
        _tasks: TaskStore,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ExecOutcome> {
        loop {
            if *cancel.borrow() {
                return Ok(ExecOutcome::Cancelled);
            }
            if cancel.changed().await.is_err() {
                return Ok(ExecOutcome::Completed);
            }
        }
    }
}

async fn wait_for_status(scheduler: &Scheduler, id: &str, status: TaskStatus) -> Task {
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        loop {
            let task = scheduler.get(id).await.unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("task {id} never reached {status:?}"))
}

#[tokio::test]
async fn worker_pool_saturates_at_capacity() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    let scheduler = Scheduler::start(
        2,
        Arc::new(MemoryStore::new()),
        Duration::from_secs(3600),
        Arc::new(GateExecutor {
            started: started_tx,
            release: release.clone(),
        }),
    );

    let t1 = scheduler.submit(params(1)).await.unwrap();
    let t2 = scheduler.submit(params(2)).await.unwrap();
    let t3 = scheduler.submit(params(3)).await.unwrap();

    // Exactly two tasks start; the third stays pending. The two running
    // tasks race on reporting, so compare as a set.
    let first = timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let second = timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let mut running = [first, second];
    running.sort();
    let mut expected = [t1.id.clone(), t2.id.clone()];
    expected.sort();
    assert_eq!(running, expected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        scheduler.get(&t3.id).await.unwrap().status,
        TaskStatus::Pending
    );

    release.add_permits(2);
    let third = timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(third, t3.id);
    release.add_permits(1);

    wait_for_status(&scheduler, &t3.id, TaskStatus::Completed).await;
}

#[tokio::test]
async fn single_worker_runs_strictly_fifo() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let scheduler = Scheduler::start(
        1,
        Arc::new(MemoryStore::new()),
        Duration::from_secs(3600),
        Arc::new(RecordingExecutor {
            order: order.clone(),
        }),
    );

    let mut submitted = Vec::new();
    for n in 0..5 {
        submitted.push(scheduler.submit(params(n)).await.unwrap().id);
    }
    for id in &submitted {
        wait_for_status(&scheduler, id, TaskStatus::Completed).await;
    }
    assert_eq!(*order.lock().unwrap(), submitted);
}

#[tokio::test]
async fn cancel_pending_task_never_runs() {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    let scheduler = Scheduler::start(
        1,
        Arc::new(MemoryStore::new()),
        Duration::from_secs(3600),
        Arc::new(GateExecutor {
            started: started_tx,
            release: release.clone(),
        }),
    );

    let blocker = scheduler.submit(params(1)).await.unwrap();
    let victim = scheduler.submit(params(2)).await.unwrap();
    timeout(Duration::from_secs(5), started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert!(scheduler.cancel(&victim.id).await.unwrap());
    let cancelled = scheduler.get(&victim.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(cancelled.started_at.is_none());
    assert!(cancelled.completed_at.is_some());

    release.add_permits(1);
    wait_for_status(&scheduler, &blocker.id, TaskStatus::Completed).await;

    // The worker drained the queue past the cancelled task without running it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(started_rx.try_recv().is_err());
    assert_eq!(
        scheduler.get(&victim.id).await.unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn cancel_running_task_stops_cooperatively() {
    let scheduler = Scheduler::start(
        1,
        Arc::new(MemoryStore::new()),
        Duration::from_secs(3600),
        Arc::new(UntilCancelledExecutor),
    );

    let task = scheduler.submit(params(1)).await.unwrap();
    wait_for_status(&scheduler, &task.id, TaskStatus::Running).await;

    assert!(scheduler.cancel(&task.id).await.unwrap());
    let task = wait_for_status(&scheduler, &task.id, TaskStatus::Cancelled).await;
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn cancel_terminal_task_returns_false() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let scheduler = Scheduler::start(
        1,
        Arc::new(MemoryStore::new()),
        Duration::from_secs(3600),
        Arc::new(RecordingExecutor { order }),
    );

    let task = scheduler.submit(params(1)).await.unwrap();
    wait_for_status(&scheduler, &task.id, TaskStatus::Completed).await;
    assert!(!scheduler.cancel(&task.id).await.unwrap());
    assert_eq!(
        scheduler.get(&task.id).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn list_filters_by_status_newest_first() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let scheduler = Scheduler::start(
        1,
        Arc::new(MemoryStore::new()),
        Duration::from_secs(3600),
        Arc::new(RecordingExecutor { order }),
    );

    let mut ids = Vec::new();
    for n in 0..3 {
        let task = scheduler.submit(params(n)).await.unwrap();
        wait_for_status(&scheduler, &task.id, TaskStatus::Completed).await;
        ids.push(task.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (tasks, total) = scheduler
        .list(Some(TaskStatus::Completed), 2)
        .await
        .unwrap();
    assert_eq!(total, 3);
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, ids[2]);

    let (none, total) = scheduler.list(Some(TaskStatus::Failed), 10).await.unwrap();
    assert!(none.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn cancel_racing_admission_never_reverts_to_running() {
    let scheduler = Scheduler::start(
        1,
        Arc::new(MemoryStore::new()),
        Duration::from_secs(3600),
        Arc::new(UntilCancelledExecutor),
    );

    // Cancel immediately after submit so the call races worker admission.
    // Whichever side wins, a record observed as cancelled must stay
    // terminal; it may never flip back to running.
    for n in 0..25 {
        let task = scheduler.submit(params(n)).await.unwrap();
        assert!(scheduler.cancel(&task.id).await.unwrap());

        let cancelled = wait_for_status(&scheduler, &task.id, TaskStatus::Cancelled).await;
        for _ in 0..20 {
            let now = scheduler.get(&task.id).await.unwrap();
            assert_eq!(now.status, TaskStatus::Cancelled);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // A task cancelled before admission must carry no start time.
        if cancelled.started_at.is_none() {
            assert!(scheduler.get(&task.id).await.unwrap().started_at.is_none());
        }
    }
}
