use std::{
    cmp::Reverse,
    collections::{BTreeMap, BinaryHeap, VecDeque, btree_map::Entry},
    fmt,
    mem,
    ops::ControlFlow,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{FutureExt, future::Shared};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use super::{
    App, Document, Key, MapperId,
    config::JobConfig,
    error::{FailureReason, JobFailure, MrError, MrResult},
    partition::{Shard, partition},
    reducer::ReduceOutput,
    shuffle::ShuffleRouter,
    worker::{Event, Task, TaskContext, TaskId, TaskKind, TaskOutcome, Worker, WorkerId},
};

type CancelSignal = Shared<Pin<Box<dyn Future<Output = ()> + Send>>>;
type Outcome = Result<JobResult, JobFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Pending,
    Mapping,
    Shuffling,
    Reducing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Mapping => "mapping",
            JobState::Shuffling => "shuffling",
            JobState::Reducing => "reducing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a job's state and task counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub state: JobState,
    pub map_tasks: usize,
    pub reduce_tasks: usize,
    /// Sends to a worker, retries included.
    pub maps_dispatched: usize,
    pub maps_completed: usize,
    pub reduces_dispatched: usize,
    pub reduces_completed: usize,
    pub retries: usize,
}

/// Final key -> value mapping of a completed job, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResult {
    values: BTreeMap<Key, i64>,
}

impl JobResult {
    fn merge(outputs: Vec<ReduceOutput>) -> MrResult<Self> {
        let mut values = BTreeMap::new();
        for output in outputs {
            for (key, value) in output.values {
                match values.entry(key) {
                    Entry::Vacant(e) => {
                        e.insert(value);
                    }
                    Entry::Occupied(mut e) => {
                        let key = String::from_utf8_lossy(e.key()).into_owned();
                        log::warn!("key {:?} reduced by more than one bucket", key);
                        let total = e.get().checked_add(value).ok_or_else(|| {
                            MrError::Internal(format!("merged total for key {:?} overflows i64", key))
                        })?;
                        e.insert(total);
                    }
                }
            }
        }
        Ok(JobResult { values })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Option<i64> {
        self.values.get(key.as_ref()).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], i64)> {
        self.values.iter().map(|(k, v)| (k.as_slice(), *v))
    }

    /// Keys decoded as UTF-8, invalid sequences replaced.
    pub fn to_string_map(&self) -> BTreeMap<String, i64> {
        self.values
            .iter()
            .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), *v))
            .collect()
    }

    pub fn into_map(self) -> BTreeMap<Key, i64> {
        self.values
    }
}

impl From<BTreeMap<Key, i64>> for JobResult {
    fn from(values: BTreeMap<Key, i64>) -> Self {
        JobResult { values }
    }
}

struct WorkerConnection {
    id: WorkerId,
    task_sender: mpsc::UnboundedSender<Task>,
    tasks: BTreeMap<TaskId, Task>,
}

impl WorkerConnection {
    fn new(id: WorkerId, task_sender: mpsc::UnboundedSender<Task>) -> WorkerConnection {
        WorkerConnection { id, task_sender, tasks: BTreeMap::new() }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DispatchResult {
    Sent { task: TaskId, worker: WorkerId, is_map: bool },
    WorkerDead,
    NoWorker,
    Empty,
}

/// Task queue plus the live workers and what each of them is running.
#[derive(Default)]
struct Scheduler {
    task_queue: VecDeque<Task>,
    workers: Vec<WorkerConnection>,
    workers_heap: BinaryHeap<Reverse<(usize, usize)>>, // (outstanding_tasks, worker_index)
    lost: Vec<Task>,
}

impl Scheduler {
    fn add_worker(&mut self, worker: WorkerConnection) {
        self.workers.push(worker);
        self.workers_heap.push(Reverse((0, self.workers.len() - 1)));
    }

    fn clear_workers(&mut self) {
        self.workers.clear();
        self.workers_heap.clear();
    }

    fn rebuild_heap(&mut self) {
        self.workers_heap = self
            .workers
            .iter()
            .enumerate()
            .map(|(i, w)| Reverse((w.tasks.len(), i)))
            .collect();
    }

    /// Removes the worker and returns the tasks it was holding.
    fn evict_worker(&mut self, worker: WorkerId) -> Option<Vec<Task>> {
        let i = self.workers.iter().position(|w| w.id == worker)?;
        let w = self.workers.remove(i);
        self.rebuild_heap();
        Some(w.tasks.into_values().collect())
    }

    fn dispatch_task_1(&mut self) -> DispatchResult {
        let Some(task) = self.task_queue.pop_front() else {
            return DispatchResult::Empty;
        };
        let Some(&Reverse((_, index))) = self.workers_heap.peek() else {
            self.task_queue.push_front(task);
            return DispatchResult::NoWorker;
        };
        let worker = &mut self.workers[index];
        if worker.task_sender.send(task.clone()).is_err() {
            let worker_id = worker.id;
            log::warn!("Worker#{} seems to be dead, evicting it", worker_id);
            self.task_queue.push_front(task);
            if let Some(lost) = self.evict_worker(worker_id) {
                self.lost.extend(lost);
            }
            return DispatchResult::WorkerDead;
        }
        let sent = DispatchResult::Sent { task: task.id, worker: worker.id, is_map: task.is_map() };
        worker.tasks.insert(task.id, task);
        let ntasks = worker.tasks.len();
        self.workers_heap.pop();
        self.workers_heap.push(Reverse((ntasks, index)));
        sent
    }

    fn remove_task(&mut self, worker: WorkerId, task: TaskId) -> Option<Task> {
        let Some(i) = self.workers.iter().position(|w| w.id == worker) else {
            log::debug!("Worker#{} not found", worker);
            return None;
        };
        let w = &mut self.workers[i];
        let Some(task) = w.tasks.remove(&task) else {
            log::debug!("task#{} not found in Worker#{}", task, worker);
            return None;
        };
        let remaining = w.tasks.len();
        self.workers_heap.retain(|&Reverse((_, j))| j != i);
        self.workers_heap.push(Reverse((remaining, i)));
        Some(task)
    }
}

/// Single owner of a job's cross-task state. Workers only talk to it
/// through `Event`s.
struct Coordinator {
    job: u64,
    config: JobConfig,
    ctx: Arc<TaskContext>,
    shards: Vec<Arc<Shard>>,
    scheduler: Scheduler,
    task_seq: TaskId,
    progress: watch::Sender<JobProgress>,
    events: mpsc::UnboundedReceiver<Event>,
    event_sender: Option<mpsc::UnboundedSender<Event>>,
    worker_handles: Vec<JoinHandle<()>>,
    maps_remaining: usize,
    reduces_remaining: usize,
    outputs: Vec<ReduceOutput>,
}

impl Coordinator {
    async fn run(mut self, cancelled: CancelSignal) -> Outcome {
        if self.shards.is_empty() {
            log::info!("job-{}: no input documents", self.job);
            self.set_state(JobState::Completed);
            return Ok(JobResult::default());
        }

        self.spawn_workers();
        self.set_state(JobState::Mapping);
        let maps: Vec<TaskKind> = self
            .shards
            .iter()
            .enumerate()
            .map(|(i, shard)| TaskKind::Map { mapper: MapperId(i), shard: shard.clone() })
            .collect();
        for kind in maps {
            self.enqueue(kind);
        }

        let mut flow = self.dispatch().await;
        let outcome = loop {
            if let ControlFlow::Break(outcome) = flow {
                break outcome;
            }
            flow = tokio::select! {
                _ = cancelled.clone() => {
                    log::warn!("job-{}: cancelled", self.job);
                    ControlFlow::Break(Err(JobFailure::new(FailureReason::Cancelled, MrError::Cancelled)))
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => ControlFlow::Break(Err(JobFailure::new(
                        FailureReason::TaskFailed,
                        MrError::Internal("every worker has exited".to_string()),
                    ))),
                },
            };
        };
        self.finish(outcome).await
    }

    fn spawn_workers(&mut self) {
        let Some(events) = self.event_sender.take() else {
            return;
        };
        for id in 0..self.config.num_workers {
            let (task_sender, tasks) = mpsc::unbounded_channel();
            let worker = Worker { id, ctx: self.ctx.clone() };
            self.worker_handles.push(tokio::spawn(worker.run(tasks, events.clone())));
            self.scheduler.add_worker(WorkerConnection::new(id, task_sender));
        }
    }

    fn shutdown_workers(&mut self) {
        self.scheduler.clear_workers();
        for handle in self.worker_handles.drain(..) {
            handle.abort();
        }
    }

    async fn finish(&mut self, outcome: Outcome) -> Outcome {
        self.shutdown_workers();
        self.ctx.router.release_all().await;
        match &outcome {
            Ok(result) => {
                log::info!("job-{}: {} keys", self.job, result.len());
                self.set_state(JobState::Completed);
            }
            Err(failure) => {
                log::warn!("job-{}: {}", self.job, failure);
                self.set_state(JobState::Failed);
            }
        }
        outcome
    }

    fn set_state(&self, state: JobState) {
        log::info!("job-{}: {}", self.job, state);
        self.progress.send_modify(|p| p.state = state);
    }

    fn enqueue(&mut self, kind: TaskKind) {
        self.task_seq += 1;
        self.scheduler.task_queue.push_back(Task { id: self.task_seq, attempt: 1, kind });
    }

    async fn dispatch(&mut self) -> ControlFlow<Outcome> {
        loop {
            loop {
                match self.scheduler.dispatch_task_1() {
                    DispatchResult::Sent { task, worker, is_map } => {
                        log::debug!("Dispatched task#{} to Worker#{}", task, worker);
                        self.progress.send_modify(|p| {
                            if is_map {
                                p.maps_dispatched += 1;
                            } else {
                                p.reduces_dispatched += 1;
                            }
                        });
                    }
                    DispatchResult::WorkerDead => {}
                    DispatchResult::Empty => break,
                    DispatchResult::NoWorker => {
                        return ControlFlow::Break(Err(JobFailure::new(
                            FailureReason::TaskFailed,
                            MrError::TransientWorker("no live workers left".to_string()),
                        )));
                    }
                }
            }
            let lost = mem::take(&mut self.scheduler.lost);
            if lost.is_empty() {
                return ControlFlow::Continue(());
            }
            for task in lost {
                let error = MrError::TransientWorker("worker lost".to_string());
                if let ControlFlow::Break(outcome) = self.retry_or_fail(task, error).await {
                    return ControlFlow::Break(outcome);
                }
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> ControlFlow<Outcome> {
        match event {
            Event::WorkerLost { worker } => {
                let Some(lost) = self.scheduler.evict_worker(worker) else {
                    return ControlFlow::Continue(());
                };
                log::warn!("Worker#{} lost with {} outstanding tasks", worker, lost.len());
                for task in lost {
                    let error = MrError::TransientWorker(format!("Worker#{} lost", worker));
                    if let ControlFlow::Break(outcome) = self.retry_or_fail(task, error).await {
                        return ControlFlow::Break(outcome);
                    }
                }
            }
            Event::Finished { worker, task, result } => {
                let Some(task) = self.scheduler.remove_task(worker, task) else {
                    return ControlFlow::Continue(());
                };
                match result {
                    Ok(TaskOutcome::Mapped { mapper, pairs }) => {
                        log::debug!("task#{}: {} emitted {} pairs", task.id, mapper, pairs);
                        self.maps_remaining -= 1;
                        self.progress.send_modify(|p| p.maps_completed += 1);
                        if self.maps_remaining == 0 {
                            self.start_reduce_phase();
                        }
                    }
                    Ok(TaskOutcome::Reduced(output)) => {
                        log::debug!("task#{}: bucket {} reduced to {} keys", task.id, output.bucket, output.values.len());
                        self.reduces_remaining -= 1;
                        self.outputs.push(output);
                        self.progress.send_modify(|p| p.reduces_completed += 1);
                        if self.reduces_remaining == 0 {
                            let outputs = mem::take(&mut self.outputs);
                            return ControlFlow::Break(
                                JobResult::merge(outputs).map_err(|e| JobFailure::new(FailureReason::TaskFailed, e)),
                            );
                        }
                    }
                    Err(error) => {
                        if let ControlFlow::Break(outcome) = self.retry_or_fail(task, error).await {
                            return ControlFlow::Break(outcome);
                        }
                    }
                }
            }
        }
        self.dispatch().await
    }

    /// Re-queues a transiently failed task while it has attempts left,
    /// otherwise fails the job with `error`.
    async fn retry_or_fail(&mut self, mut task: Task, error: MrError) -> ControlFlow<Outcome> {
        if error.is_transient() && task.attempt < self.config.max_attempts {
            log::warn!("task#{} attempt {} failed: {}; retrying", task.id, task.attempt, error);
            task.attempt += 1;
            self.progress.send_modify(|p| p.retries += 1);
            self.scheduler.task_queue.push_back(task);
            return ControlFlow::Continue(());
        }
        log::warn!("task#{} failed after {} attempts: {}", task.id, task.attempt, error);
        if let TaskKind::Map { mapper, .. } = &task.kind {
            self.ctx.router.mark_failed(*mapper).await;
        }
        ControlFlow::Break(Err(JobFailure::new(FailureReason::TaskFailed, error)))
    }

    fn start_reduce_phase(&mut self) {
        self.set_state(JobState::Shuffling);
        let mappers: Arc<[MapperId]> = (0..self.shards.len()).map(MapperId).collect();
        for bucket in 0..self.config.num_reducers {
            self.enqueue(TaskKind::Reduce { bucket, mappers: mappers.clone() });
        }
        self.set_state(JobState::Reducing);
    }
}

/// Controls a running job.
///
/// Dropping the handle, together with every `Canceller` taken from it,
/// cancels the job.
pub struct JobHandle {
    job: u64,
    progress: watch::Receiver<JobProgress>,
    cancel: Arc<watch::Sender<bool>>,
    router: Arc<ShuffleRouter>,
    join: JoinHandle<Outcome>,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.job
    }

    pub fn progress(&self) -> JobProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobProgress> {
        self.progress.clone()
    }

    /// Waits until the job reaches `state` or ends, whichever comes first.
    pub async fn wait_for(&self, state: JobState) -> JobProgress {
        let mut rx = self.progress.clone();
        let reached = rx
            .wait_for(|p| p.state == state || p.state.is_terminal())
            .await
            .map(|p| JobProgress::clone(&p));
        match reached {
            Ok(progress) => progress,
            Err(_) => rx.borrow().clone(),
        }
    }

    pub fn router(&self) -> Arc<ShuffleRouter> {
        self.router.clone()
    }

    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn canceller(&self) -> Canceller {
        Canceller(self.cancel.clone())
    }

    pub async fn join(self) -> Result<JobResult, JobFailure> {
        let JobHandle { join, cancel, .. } = self;
        let outcome = join.await;
        drop(cancel);
        match outcome {
            Ok(outcome) => outcome,
            Err(e) => Err(JobFailure::new(
                FailureReason::TaskFailed,
                MrError::Internal(format!("coordinator stopped: {}", e)),
            )),
        }
    }
}

#[derive(Clone)]
pub struct Canceller(Arc<watch::Sender<bool>>);

impl Canceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

pub struct Master {
    config: JobConfig,
    job_seq: AtomicU64,
}

impl Master {
    pub fn new(config: JobConfig) -> Self {
        Master { config, job_seq: AtomicU64::new(0) }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Validates the configuration, partitions the input and starts the job
    /// on the current tokio runtime.
    pub fn submit(&self, documents: Vec<Document>, app: App) -> MrResult<JobHandle> {
        let config = self.config.clone();
        config.validate()?;
        let job = self.job_seq.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!(
            "job-{}: submitting {} documents to app {} ({} mappers, {} reducers, {} workers)",
            job,
            documents.len(),
            app.name,
            config.num_mappers,
            config.num_reducers,
            config.num_workers
        );

        let shards: Vec<Arc<Shard>> = if documents.is_empty() {
            Vec::new()
        } else {
            partition(documents, config.num_mappers)?.into_iter().map(Arc::new).collect()
        };
        let reduce_tasks = if shards.is_empty() { 0 } else { config.num_reducers };

        let router = Arc::new(ShuffleRouter::new(job, config.num_reducers));
        let ctx = Arc::new(TaskContext {
            map: app.map,
            reduce: app.reduce,
            router: router.clone(),
            num_buckets: config.num_reducers,
            task_timeout: config.task_timeout,
        });
        let (progress, progress_rx) = watch::channel(JobProgress {
            map_tasks: shards.len(),
            reduce_tasks,
            ..JobProgress::default()
        });
        let (cancel, mut cancel_rx) = watch::channel(false);
        let cancelled = async move {
            let _ = cancel_rx.wait_for(|c| *c).await;
        }
        .boxed()
        .shared();
        let (event_sender, events) = mpsc::unbounded_channel();

        let coordinator = Coordinator {
            job,
            ctx,
            maps_remaining: shards.len(),
            reduces_remaining: reduce_tasks,
            shards,
            config,
            scheduler: Scheduler::default(),
            task_seq: 0,
            progress,
            events,
            event_sender: Some(event_sender),
            worker_handles: Vec::new(),
            outputs: Vec::new(),
        };
        let join = tokio::spawn(coordinator.run(cancelled));

        Ok(JobHandle { job, progress: progress_rx, cancel: Arc::new(cancel), router, join })
    }

    /// Runs a job to completion.
    pub async fn run(&self, documents: Vec<Document>, app: App) -> Result<JobResult, JobFailure> {
        let handle = self
            .submit(documents, app)
            .map_err(|e| JobFailure::new(FailureReason::Rejected, e))?;
        handle.join().await
    }
}

impl Default for Master {
    fn default() -> Self {
        Master::new(JobConfig::default())
    }
}
