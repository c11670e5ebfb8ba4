use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crate::mr::{
    Accumulator, App, Document, DocumentId, FailureReason, JobConfig, JobState, KeyValue, MapFunction, Master,
    MrError, Pairs, ReduceFunction, SumReducer, documents,
};
use crate::mrapps::{get_app, wc::WC};
use crate::mrrt::sequential;

const CORPUS: &[&str] = &[
    "It was the best of times, it was the worst of times,",
    "it was the age of wisdom, it was the age of foolishness,",
    "it was the epoch of belief, it was the epoch of incredulity,",
    "it was the season of Light, it was the season of Darkness,",
    "it was the spring of hope, it was the winter of despair,",
    "we had everything before us, we had nothing before us,",
    "we were all going direct to Heaven, we were all going direct the other way",
];

fn init_logger() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn counts(pairs: &[(&str, i64)]) -> BTreeMap<String, i64> {
    pairs.iter().map(|&(k, v)| (k.to_string(), v)).collect()
}

/// Word count that fails on one document.
struct FailOn(DocumentId);

impl MapFunction for FailOn {
    fn map<'a>(&'a self, doc: &'a Document) -> Pairs<'a> {
        if doc.id() == self.0 {
            return Box::new(std::iter::once(Err::<KeyValue, _>(anyhow::anyhow!("unreadable document"))));
        }
        WC.map(doc)
    }
}

impl ReduceFunction for FailOn {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error> {
        SumReducer.reduce(acc, kv)
    }
}

/// Word count whose reduce rejects one key.
struct RejectKey(&'static str);

impl ReduceFunction for RejectKey {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error> {
        anyhow::ensure!(kv.key != self.0.as_bytes(), "refusing {}", self.0);
        SumReducer.reduce(acc, kv)
    }
}

/// Word count whose first map call panics.
#[derive(Default)]
struct PanicOnce {
    panicked: AtomicBool,
}

impl MapFunction for PanicOnce {
    fn map<'a>(&'a self, doc: &'a Document) -> Pairs<'a> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("simulated worker crash");
        }
        WC.map(doc)
    }
}

impl ReduceFunction for PanicOnce {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error> {
        SumReducer.reduce(acc, kv)
    }
}

struct AlwaysPanics;

impl MapFunction for AlwaysPanics {
    fn map<'a>(&'a self, _doc: &'a Document) -> Pairs<'a> {
        panic!("simulated worker crash");
    }
}

/// Word count whose first map call outlives any short deadline.
#[derive(Default)]
struct SlowOnce {
    slowed: AtomicBool,
}

impl MapFunction for SlowOnce {
    fn map<'a>(&'a self, doc: &'a Document) -> Pairs<'a> {
        if !self.slowed.swap(true, Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(500));
        }
        WC.map(doc)
    }
}

impl ReduceFunction for SlowOnce {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error> {
        SumReducer.reduce(acc, kv)
    }
}

/// Emits a count too large to add to for every document.
struct Huge;

impl MapFunction for Huge {
    fn map<'a>(&'a self, _doc: &'a Document) -> Pairs<'a> {
        Box::new(
            [KeyValue::new("k", i64::MAX), KeyValue::new("k", 1)]
                .into_iter()
                .map(Ok::<_, anyhow::Error>),
        )
    }
}

/// Word count with a reduce that takes a while per pair.
struct SlowReduce;

impl MapFunction for SlowReduce {
    fn map<'a>(&'a self, doc: &'a Document) -> Pairs<'a> {
        WC.map(doc)
    }
}

impl ReduceFunction for SlowReduce {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error> {
        thread::sleep(Duration::from_millis(100));
        SumReducer.reduce(acc, kv)
    }
}

#[tokio::test]
async fn test_wc() {
    init_logger();
    let master = Master::new(JobConfig::new(2).with_workers(2));
    let result = master
        .run(documents(["to be or", "not to be"]), get_app("wc").unwrap())
        .await
        .unwrap();
    assert_eq!(result.to_string_map(), counts(&[("to", 2), ("be", 2), ("or", 1), ("not", 1)]));
}

#[tokio::test]
async fn test_wc_single_document() {
    init_logger();
    let master = Master::new(JobConfig::new(2).with_workers(2));
    let handle = master.submit(documents(["to be or not to be"]), get_app("wc").unwrap()).unwrap();
    let progress = handle.subscribe();
    let result = handle.join().await.unwrap();

    assert_eq!(result.to_string_map(), counts(&[("to", 2), ("be", 2), ("or", 1), ("not", 1)]));
    let progress = progress.borrow().clone();
    assert_eq!((progress.map_tasks, progress.maps_completed), (2, 2));
    assert_eq!(progress.reduces_completed, 2);
}

#[tokio::test]
async fn test_single_partition() {
    init_logger();
    let master = Master::new(JobConfig::new(1).with_workers(1));
    let result = master
        .run(documents(["a b a", "b a"]), get_app("wc").unwrap())
        .await
        .unwrap();
    assert_eq!(result.to_string_map(), counts(&[("a", 3), ("b", 2)]));
}

#[tokio::test]
async fn test_empty_input() {
    init_logger();
    let master = Master::new(JobConfig::new(4));
    let handle = master.submit(Vec::new(), get_app("wc").unwrap()).unwrap();
    let progress = handle.subscribe();
    let result = handle.join().await.unwrap();
    assert!(result.is_empty());

    let progress = progress.borrow().clone();
    assert_eq!(progress.state, JobState::Completed);
    assert_eq!(progress.maps_dispatched, 0);
    assert_eq!(progress.reduces_dispatched, 0);
}

#[tokio::test]
async fn test_more_partitions_than_documents() {
    init_logger();
    let master = Master::new(JobConfig::new(8).with_workers(3));
    let result = master.run(documents(["one two", "two"]), get_app("wc").unwrap()).await.unwrap();
    assert_eq!(result.to_string_map(), counts(&[("one", 1), ("two", 2)]));
}

#[tokio::test]
async fn test_deterministic() {
    init_logger();
    let master = Master::new(JobConfig::new(3).with_workers(4));
    let first = master.run(documents(CORPUS.iter().copied()), get_app("wc").unwrap()).await.unwrap();
    let second = master.run(documents(CORPUS.iter().copied()), get_app("wc").unwrap()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_matches_sequential() {
    init_logger();
    let app = get_app("wc").unwrap();
    let expected = sequential::run(&app, &documents(CORPUS.iter().copied())).unwrap();
    assert_eq!(expected.get("was"), Some(10));

    for (p, mappers, reducers) in [(1, 1, 1), (2, 2, 2), (4, 3, 4), (5, 5, 2), (7, 2, 7), (16, 16, 16)] {
        let config = JobConfig::new(p).with_mappers(mappers).with_reducers(reducers).with_workers(3);
        let result = Master::new(config)
            .run(documents(CORPUS.iter().copied()), app.clone())
            .await
            .unwrap();
        assert_eq!(result, expected, "p={} mappers={} reducers={}", p, mappers, reducers);
    }
}

#[tokio::test]
async fn test_regex_app_agrees() {
    init_logger();
    let master = Master::new(JobConfig::new(3));
    let wc = master.run(documents(CORPUS.iter().copied()), get_app("wc").unwrap()).await.unwrap();
    let rwc = master.run(documents(CORPUS.iter().copied()), get_app("rwc").unwrap()).await.unwrap();
    assert_eq!(wc, rwc);
}

#[tokio::test]
async fn test_progress_counters() {
    init_logger();
    let master = Master::new(JobConfig::new(4).with_reducers(3).with_workers(2));
    let handle = master.submit(documents(CORPUS.iter().copied()), get_app("wc").unwrap()).unwrap();
    let progress = handle.subscribe();
    handle.join().await.unwrap();

    let progress = progress.borrow().clone();
    assert_eq!(progress.state, JobState::Completed);
    assert_eq!((progress.map_tasks, progress.reduce_tasks), (4, 3));
    assert_eq!((progress.maps_dispatched, progress.maps_completed), (4, 4));
    assert_eq!((progress.reduces_dispatched, progress.reduces_completed), (3, 3));
    assert_eq!(progress.retries, 0);
}

#[tokio::test]
async fn test_map_failure_fails_job() {
    init_logger();
    let master = Master::new(JobConfig::new(2).with_workers(2));
    let handle = master
        .submit(documents(["a", "b", "c", "d", "e"]), App::new("fail", FailOn(DocumentId(2))))
        .unwrap();
    let progress = handle.subscribe();
    let failure = handle.join().await.unwrap_err();

    assert_eq!(failure.reason, FailureReason::TaskFailed);
    match &failure.error {
        MrError::MapFunction { document, .. } => assert_eq!(*document, DocumentId(2)),
        other => panic!("unexpected {:?}", other),
    }
    let progress = progress.borrow().clone();
    assert_eq!(progress.state, JobState::Failed);
    assert_eq!(progress.reduces_dispatched, 0);
    assert_eq!(progress.retries, 0);
}

#[tokio::test]
async fn test_reduce_failure_fails_job() {
    init_logger();
    let app = App::from_parts("reject", Arc::new(WC), Arc::new(RejectKey("or")));
    let failure = Master::new(JobConfig::new(2))
        .run(documents(["to be or", "not to be"]), app)
        .await
        .unwrap_err();
    assert_eq!(failure.reason, FailureReason::TaskFailed);
    assert!(matches!(failure.error, MrError::ReduceFunction { .. }));
}

#[tokio::test]
async fn test_sum_overflow_fails_without_retry() {
    init_logger();
    let app = App::from_parts("huge", Arc::new(Huge), Arc::new(SumReducer));
    let handle = Master::new(JobConfig::new(1).with_workers(1)).submit(documents(["x"]), app).unwrap();
    let progress = handle.subscribe();
    let failure = handle.join().await.unwrap_err();

    assert_eq!(failure.reason, FailureReason::TaskFailed);
    assert!(matches!(failure.error, MrError::ReduceFunction { bucket: 0, .. }));
    assert_eq!(progress.borrow().retries, 0);
}

#[tokio::test]
async fn test_crashed_task_is_retried() {
    init_logger();
    let master = Master::new(JobConfig::new(2).with_workers(2));
    let handle = master
        .submit(documents(["to be or", "not to be"]), App::new("crash", PanicOnce::default()))
        .unwrap();
    let progress = handle.subscribe();
    let result = handle.join().await.unwrap();

    assert_eq!(result.to_string_map(), counts(&[("to", 2), ("be", 2), ("or", 1), ("not", 1)]));
    let progress = progress.borrow().clone();
    assert_eq!(progress.retries, 1);
    assert_eq!(progress.maps_dispatched, 3);
}

#[tokio::test]
async fn test_retries_exhausted() {
    init_logger();
    let app = App::from_parts("crash", Arc::new(AlwaysPanics), Arc::new(SumReducer));
    let master = Master::new(JobConfig::new(1).with_workers(1).with_max_attempts(2));
    let handle = master.submit(documents(["x"]), app).unwrap();
    let progress = handle.subscribe();
    let failure = handle.join().await.unwrap_err();

    assert_eq!(failure.reason, FailureReason::TaskFailed);
    assert!(matches!(failure.error, MrError::TransientWorker(_)));
    assert_eq!(progress.borrow().retries, 1);
}

#[tokio::test]
async fn test_timed_out_task_is_retried() {
    init_logger();
    let config = JobConfig::new(1).with_workers(1).with_task_timeout(Duration::from_millis(100));
    let handle = Master::new(config)
        .submit(documents(["slow words here"]), App::new("slow", SlowOnce::default()))
        .unwrap();
    let progress = handle.subscribe();
    let result = handle.join().await.unwrap();

    assert_eq!(result.to_string_map(), counts(&[("slow", 1), ("words", 1), ("here", 1)]));
    assert_eq!(progress.borrow().retries, 1);
}

#[tokio::test]
async fn test_cancel_while_reducing() {
    init_logger();
    let master = Master::new(JobConfig::new(1).with_workers(1));
    let handle = master.submit(documents(["a b c d"]), App::new("slow", SlowReduce)).unwrap();
    let router = handle.router();
    let progress = handle.subscribe();

    let reached = handle.wait_for(JobState::Reducing).await;
    assert_eq!(reached.state, JobState::Reducing);
    handle.cancel();
    let failure = handle.join().await.unwrap_err();

    assert_eq!(failure.reason, FailureReason::Cancelled);
    assert!(matches!(failure.error, MrError::Cancelled));
    assert_eq!(router.buffered_buckets().await, 0);
    assert_eq!(progress.borrow().state, JobState::Failed);
}

#[tokio::test]
async fn test_canceller_outlives_handle_use() {
    init_logger();
    let master = Master::new(JobConfig::new(1).with_workers(1));
    let handle = master.submit(documents(["a b c d"]), App::new("slow", SlowReduce)).unwrap();
    let canceller = handle.canceller();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    let failure = handle.join().await.unwrap_err();
    assert_eq!(failure.reason, FailureReason::Cancelled);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    init_logger();
    let master = Master::new(JobConfig::new(2).with_reducers(3));
    let failure = master.run(documents(["a"]), get_app("wc").unwrap()).await.unwrap_err();
    assert_eq!(failure.reason, FailureReason::Rejected);
    assert!(matches!(failure.error, MrError::InvalidArgument(_)));

    let master = Master::new(JobConfig::new(0));
    assert!(master.submit(documents(["a"]), get_app("wc").unwrap()).is_err());
}
