use std::{any::Any, sync::Arc, time::Duration};

use tokio::{sync::mpsc, task, time};

use super::{
    MapFunction, MapperId, ReduceFunction,
    error::{MrError, MrResult},
    mapper::map_task,
    partition::Shard,
    reducer::{ReduceOutput, reduce_task},
    shuffle::ShuffleRouter,
};

pub(crate) type TaskId = u64;
pub(crate) type WorkerId = usize;

#[derive(Debug, Clone)]
pub(crate) enum TaskKind {
    Map { mapper: MapperId, shard: Arc<Shard> },
    Reduce { bucket: usize, mappers: Arc<[MapperId]> },
}

#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub id: TaskId,
    pub attempt: u32,
    pub kind: TaskKind,
}

impl Task {
    pub fn is_map(&self) -> bool {
        matches!(self.kind, TaskKind::Map { .. })
    }
}

#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Mapped { mapper: MapperId, pairs: usize },
    Reduced(ReduceOutput),
}

#[derive(Debug)]
pub(crate) enum Event {
    Finished { worker: WorkerId, task: TaskId, result: MrResult<TaskOutcome> },
    WorkerLost { worker: WorkerId },
}

/// What every worker of a job needs to run its tasks.
pub(crate) struct TaskContext {
    pub map: Arc<dyn MapFunction>,
    pub reduce: Arc<dyn ReduceFunction>,
    pub router: Arc<ShuffleRouter>,
    pub num_buckets: usize,
    pub task_timeout: Option<Duration>,
}

/// Reports the worker as lost however its loop ends, unwinding included.
struct ExitGuard {
    worker: WorkerId,
    events: mpsc::UnboundedSender<Event>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.events.send(Event::WorkerLost { worker: self.worker });
    }
}

pub(crate) struct Worker {
    pub id: WorkerId,
    pub ctx: Arc<TaskContext>,
}

impl Worker {
    /// Runs tasks one at a time until the coordinator drops the task sender.
    pub async fn run(self, mut tasks: mpsc::UnboundedReceiver<Task>, events: mpsc::UnboundedSender<Event>) {
        let _guard = ExitGuard { worker: self.id, events: events.clone() };
        log::debug!("Worker#{} started", self.id);
        while let Some(task) = tasks.recv().await {
            log::debug!("Worker#{} running task#{} (attempt {})", self.id, task.id, task.attempt);
            let result = self.execute(&task).await;
            if let Err(e) = &result {
                log::debug!("Worker#{} task#{} failed: {}", self.id, task.id, e);
            }
            if events.send(Event::Finished { worker: self.id, task: task.id, result }).is_err() {
                break;
            }
        }
        log::debug!("Worker#{} exiting", self.id);
    }

    async fn execute(&self, task: &Task) -> MrResult<TaskOutcome> {
        let ctx = &self.ctx;
        match &task.kind {
            TaskKind::Map { mapper, shard } => {
                let map = ctx.map.clone();
                let shard = shard.clone();
                let n = ctx.num_buckets;
                let output = run_blocking(ctx.task_timeout, move || map_task(&shard, map.as_ref(), n)).await?;
                let pairs = output.pair_count();
                ctx.router.publish(*mapper, output).await?;
                Ok(TaskOutcome::Mapped { mapper: *mapper, pairs })
            }
            TaskKind::Reduce { bucket, mappers } => {
                let bucket = *bucket;
                let inputs = ctx.router.fetch(bucket, mappers).await?;
                let reduce = ctx.reduce.clone();
                let output = run_blocking(ctx.task_timeout, move || reduce_task(bucket, &inputs, reduce.as_ref())).await?;
                Ok(TaskOutcome::Reduced(output))
            }
        }
    }
}

/// Runs user code on the blocking pool. A panic counts as a worker crash and
/// is reported as a transient error.
async fn run_blocking<T, F>(timeout: Option<Duration>, f: F) -> MrResult<T>
where
    F: FnOnce() -> MrResult<T> + Send + 'static,
    T: Send + 'static,
{
    let handle = task::spawn_blocking(f);
    let joined = match timeout {
        Some(limit) => time::timeout(limit, handle)
            .await
            .map_err(|_| MrError::TaskTimeout(limit))?,
        None => handle.await,
    };
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(MrError::TransientWorker(format!(
            "task panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(MrError::TransientWorker(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
