use super::{
    KeyValue, MapFunction,
    error::{MrError, MrResult},
    partition::Shard,
};
use crate::util::hash;

pub type Bucket = Vec<KeyValue>;

/// The pairs one map task produced, split into one bucket per reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperOutput {
    buckets: Vec<Bucket>,
}

impl MapperOutput {
    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    pub fn pair_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn into_buckets(self) -> Vec<Bucket> {
        self.buckets
    }
}

/// Bucket index owning `key` when there are `num_buckets` reducers.
pub fn bucket_for(key: &[u8], num_buckets: usize) -> usize {
    hash(key) as usize % num_buckets
}

/// Runs `map` over every document of the shard. Stops at the first failing
/// document; nothing is returned for the documents already mapped.
pub fn map_task(shard: &Shard, map: &dyn MapFunction, num_buckets: usize) -> MrResult<MapperOutput> {
    if num_buckets == 0 {
        return Err(MrError::invalid("bucket count must be at least 1"));
    }
    let mut buckets: Vec<Bucket> = (0..num_buckets).map(|_| Vec::new()).collect();
    for doc in shard.documents() {
        for kv in map.map(doc) {
            let kv = kv.map_err(|source| MrError::MapFunction { document: doc.id(), source })?;
            buckets[bucket_for(&kv.key, num_buckets)].push(kv);
        }
    }
    if shard.is_empty() {
        log::debug!("shard {} is empty", shard.index());
    }
    Ok(MapperOutput { buckets })
}
