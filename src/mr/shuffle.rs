use std::{collections::BTreeMap, fmt, sync::Arc};

use tokio::sync::{Mutex, watch};

use super::{
    MapperId,
    error::{MrError, MrResult},
    mapper::{Bucket, MapperOutput},
};

/// Logical address of one published bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketRef {
    pub job: u64,
    pub mapper: MapperId,
    pub bucket: usize,
}

impl fmt::Display for BucketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shuffle://job-{}/{}/bucket-{}", self.job, self.mapper, self.bucket)
    }
}

enum Slot {
    Pending,
    Published(Vec<Arc<Bucket>>),
    Failed,
    Released,
}

struct Slots {
    map: BTreeMap<MapperId, watch::Sender<Slot>>,
    released: bool,
}

impl Slots {
    fn sender(&mut self, mapper: MapperId) -> &watch::Sender<Slot> {
        self.map.entry(mapper).or_insert_with(|| watch::channel(Slot::Pending).0)
    }
}

/// Holds every mapper's buckets until the reducers fetch them.
///
/// Map workers publish straight into the router and reduce workers fetch
/// from it, so bucket data never travels through the coordinator.
pub struct ShuffleRouter {
    job: u64,
    num_buckets: usize,
    slots: Mutex<Slots>,
}

impl ShuffleRouter {
    pub fn new(job: u64, num_buckets: usize) -> Self {
        ShuffleRouter {
            job,
            num_buckets,
            slots: Mutex::new(Slots { map: BTreeMap::new(), released: false }),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.num_buckets
    }

    /// Registers the output of `mapper`, replacing an earlier one from a
    /// previous attempt.
    pub async fn publish(&self, mapper: MapperId, output: MapperOutput) -> MrResult<Vec<BucketRef>> {
        if output.num_buckets() != self.num_buckets {
            return Err(MrError::invalid(format!(
                "{} published {} buckets, expected {}",
                mapper,
                output.num_buckets(),
                self.num_buckets
            )));
        }
        let buckets: Vec<Arc<Bucket>> = output.into_buckets().into_iter().map(Arc::new).collect();
        let mut slots = self.slots.lock().await;
        if slots.released {
            return Err(MrError::Cancelled);
        }
        slots.sender(mapper).send_replace(Slot::Published(buckets));
        log::trace!("{} published {} buckets", mapper, self.num_buckets);
        Ok((0..self.num_buckets)
            .map(|bucket| BucketRef { job: self.job, mapper, bucket })
            .collect())
    }

    /// Returns bucket `bucket` of every listed mapper, waiting for mappers
    /// that have not published yet.
    pub async fn fetch(&self, bucket: usize, mappers: &[MapperId]) -> MrResult<Vec<Arc<Bucket>>> {
        if bucket >= self.num_buckets {
            return Err(MrError::invalid(format!(
                "bucket {} out of range 0..{}",
                bucket, self.num_buckets
            )));
        }
        let receivers: Vec<(MapperId, watch::Receiver<Slot>)> = {
            let mut slots = self.slots.lock().await;
            if slots.released {
                return Err(MrError::Cancelled);
            }
            mappers.iter().map(|&m| (m, slots.sender(m).subscribe())).collect()
        };

        let mut fetched = Vec::with_capacity(receivers.len());
        for (mapper, mut rx) in receivers {
            let data = {
                let slot = rx
                    .wait_for(|s| !matches!(s, Slot::Pending))
                    .await
                    .map_err(|_| MrError::Cancelled)?;
                match &*slot {
                    Slot::Published(buckets) => Ok(buckets[bucket].clone()),
                    Slot::Failed => Err(MrError::UpstreamTaskFailed { mapper }),
                    Slot::Released | Slot::Pending => Err(MrError::Cancelled),
                }
            };
            fetched.push(data?);
        }
        log::trace!("fetched bucket {} from {} mappers", bucket, fetched.len());
        Ok(fetched)
    }

    /// Marks `mapper` as permanently failed. Fetches that depend on it fail
    /// with `UpstreamTaskFailed` instead of waiting.
    pub async fn mark_failed(&self, mapper: MapperId) {
        let mut slots = self.slots.lock().await;
        if !slots.released {
            slots.sender(mapper).send_replace(Slot::Failed);
        }
    }

    /// Drops every buffered bucket and wakes blocked fetches.
    pub async fn release_all(&self) {
        let mut slots = self.slots.lock().await;
        slots.released = true;
        for sender in slots.map.values() {
            sender.send_replace(Slot::Released);
        }
        let n = slots.map.len();
        slots.map.clear();
        log::debug!("job-{}: released shuffle buffers of {} mappers", self.job, n);
    }

    /// Number of bucket buffers currently held.
    pub async fn buffered_buckets(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .map
            .values()
            .map(|s| match &*s.borrow() {
                Slot::Published(buckets) => buckets.len(),
                _ => 0,
            })
            .sum()
    }
}
