use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use super::{
    Key, KeyValue, ReduceFunction,
    error::{MrError, MrResult},
    mapper::Bucket,
};

/// Running per-key totals of one reduce task.
#[derive(Debug, Default)]
pub struct Accumulator {
    values: HashMap<Key, i64>,
}

impl Accumulator {
    /// Adds `delta` to the total of `key`. Fails, leaving the total
    /// unchanged, if the sum leaves the i64 range.
    pub fn add(&mut self, key: &[u8], delta: i64) -> Result<(), anyhow::Error> {
        if let Some(v) = self.values.get_mut(key) {
            *v = v.checked_add(delta).ok_or_else(|| {
                anyhow::anyhow!("sum for key {:?} overflows i64", String::from_utf8_lossy(key))
            })?;
        } else {
            self.values.insert(key.to_vec(), delta);
        }
        Ok(())
    }

    pub fn set(&mut self, key: &[u8], value: i64) {
        self.values.insert(key.to_vec(), value);
    }

    pub fn get(&self, key: &[u8]) -> Option<i64> {
        self.values.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Ordered snapshot of the totals.
    pub fn finalize(self) -> BTreeMap<Key, i64> {
        self.values.into_iter().collect()
    }
}

/// Finalized output of the reduce task for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceOutput {
    pub bucket: usize,
    pub values: BTreeMap<Key, i64>,
}

/// Sums values per key.
#[derive(Debug, Clone, Copy, Default)]
pub struct SumReducer;

impl ReduceFunction for SumReducer {
    fn reduce(&self, acc: &mut Accumulator, kv: &KeyValue) -> Result<(), anyhow::Error> {
        acc.add(&kv.key, kv.value)
    }
}

/// Folds `reduce` over every pair of every input bucket.
pub fn reduce_task(bucket: usize, inputs: &[Arc<Bucket>], reduce: &dyn ReduceFunction) -> MrResult<ReduceOutput> {
    let mut acc = Accumulator::default();
    for kv in inputs.iter().flat_map(|b| b.iter()) {
        reduce
            .reduce(&mut acc, kv)
            .map_err(|source| MrError::ReduceFunction { bucket, source })?;
    }
    log::trace!("bucket {} reduced to {} keys", bucket, acc.len());
    Ok(ReduceOutput { bucket, values: acc.finalize() })
}
