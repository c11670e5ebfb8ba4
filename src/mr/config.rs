use std::{num::NonZeroUsize, thread, time::Duration};

use super::error::{MrError, MrResult};

const DEFAULT_PARTITIONS: usize = 8;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Settings for one job.
///
/// `num_partitions` bounds both the number of map tasks (`num_mappers`,
/// one per shard) and the number of reduce tasks (`num_reducers`, one per
/// bucket). Both default to `num_partitions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub num_partitions: usize,
    pub num_mappers: usize,
    pub num_reducers: usize,
    pub num_workers: usize,
    /// Total attempts per task, first run included.
    pub max_attempts: u32,
    pub task_timeout: Option<Duration>,
}

impl JobConfig {
    pub fn new(num_partitions: usize) -> Self {
        JobConfig {
            num_partitions,
            num_mappers: num_partitions,
            num_reducers: num_partitions,
            num_workers: thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            task_timeout: None,
        }
    }

    pub fn with_mappers(mut self, n: usize) -> Self {
        self.num_mappers = n;
        self
    }

    pub fn with_reducers(mut self, n: usize) -> Self {
        self.num_reducers = n;
        self
    }

    pub fn with_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> MrResult<()> {
        if self.num_partitions == 0 {
            return Err(MrError::invalid("num_partitions must be at least 1"));
        }
        if self.num_mappers == 0 || self.num_mappers > self.num_partitions {
            return Err(MrError::invalid(format!(
                "num_mappers must be in 1..={}, got {}",
                self.num_partitions, self.num_mappers
            )));
        }
        if self.num_reducers == 0 || self.num_reducers > self.num_partitions {
            return Err(MrError::invalid(format!(
                "num_reducers must be in 1..={}, got {}",
                self.num_partitions, self.num_reducers
            )));
        }
        if self.num_workers == 0 {
            return Err(MrError::invalid("num_workers must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(MrError::invalid("max_attempts must be at least 1"));
        }
        if self.task_timeout == Some(Duration::ZERO) {
            return Err(MrError::invalid("task_timeout must be positive"));
        }
        Ok(())
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        JobConfig::new(DEFAULT_PARTITIONS)
    }
}
