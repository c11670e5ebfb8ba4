use crate::mr::{Accumulator, App, Document, JobResult, MrError, MrResult};

/// Single pass over every document with one accumulator: no partitioning,
/// no buckets, no workers.
pub fn run(app: &App, documents: &[Document]) -> MrResult<JobResult> {
    let mut acc = Accumulator::default();
    for doc in documents {
        for kv in app.map.map(doc) {
            let kv = kv.map_err(|source| MrError::MapFunction { document: doc.id(), source })?;
            app.reduce
                .reduce(&mut acc, &kv)
                .map_err(|source| MrError::ReduceFunction { bucket: 0, source })?;
        }
    }
    Ok(JobResult::from(acc.finalize()))
}
