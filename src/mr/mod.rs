use std::{fmt, sync::Arc};

pub mod config;
pub mod error;
pub mod mapper;
pub mod master;
pub mod partition;
pub mod reducer;
pub mod shuffle;
pub(crate) mod worker;

pub use config::JobConfig;
pub use error::{FailureReason, JobFailure, MrError, MrResult};
pub use mapper::{Bucket, MapperOutput, map_task};
pub use master::{Canceller, JobHandle, JobProgress, JobResult, JobState, Master};
pub use partition::{Shard, partition};
pub use reducer::{Accumulator, ReduceOutput, SumReducer, reduce_task};
pub use shuffle::{BucketRef, ShuffleRouter};

pub type Key = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Key,
    pub value: i64,
}

impl KeyValue {
    pub fn new(key: impl Into<Key>, value: i64) -> Self {
        KeyValue { key: key.into(), value }
    }
}

/// Position of a document in the submitted input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(pub usize);

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "doc#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapperId(pub usize);

impl fmt::Display for MapperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    text: Arc<str>,
}

impl Document {
    pub fn new(id: usize, text: impl Into<Arc<str>>) -> Self {
        Document { id: DocumentId(id), text: text.into() }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Numbers the texts in order, starting at zero.
pub fn documents<I, S>(texts: I) -> Vec<Document>
where
    I: IntoIterator<Item = S>,
    S: Into<Arc<str>>,
{
    texts.into_iter().enumerate().map(|(i, t)| Document::new(i, t)).collect()
}

/// Lazy sequence of pairs produced for one document.
pub type Pairs<'a> = Box<dyn Iterator<Item = Result<KeyValue, anyhow::Error>> + 'a>;

/// User map function.
///
/// Calling `map` twice on the same document must yield the same pairs:
/// failed and lost tasks are re-run with the same shard.
pub trait MapFunction: Send + Sync {
    fn map<'a>(&'a self, doc: &'a Document) -> Pairs<'a>;
}

/// User reduce function. Pairs arrive in no particular order, so the fold
/// must not depend on it (summing qualifies, concatenation does not).
pub trait ReduceFunction: Send + Sync {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error>;
}

/// A map function paired with a reduce function.
#[derive(Clone)]
pub struct App {
    pub name: String,
    pub map: Arc<dyn MapFunction>,
    pub reduce: Arc<dyn ReduceFunction>,
}

impl App {
    pub fn new<A>(name: impl Into<String>, app: A) -> Self
    where
        A: MapFunction + ReduceFunction + 'static,
    {
        let app = Arc::new(app);
        App { name: name.into(), map: app.clone(), reduce: app }
    }

    pub fn from_parts(
        name: impl Into<String>,
        map: Arc<dyn MapFunction>,
        reduce: Arc<dyn ReduceFunction>,
    ) -> Self {
        App { name: name.into(), map, reduce }
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App").field("name", &self.name).finish_non_exhaustive()
    }
}
