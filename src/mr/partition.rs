use super::{
    Document,
    error::{MrError, MrResult},
};

/// Documents assigned to one map task.
#[derive(Debug, Clone)]
pub struct Shard {
    index: usize,
    documents: Vec<Document>,
}

impl Shard {
    pub fn new(index: usize, documents: Vec<Document>) -> Self {
        Shard { index, documents }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Splits `documents` into exactly `n` shards, round-robin: document `i`
/// lands in shard `i % n`, keeping input order within a shard. Shards differ
/// in size by at most one; when `n` exceeds the document count the trailing
/// shards are empty.
pub fn partition(documents: Vec<Document>, n: usize) -> MrResult<Vec<Shard>> {
    if n == 0 {
        return Err(MrError::invalid("partition count must be at least 1"));
    }
    if documents.is_empty() {
        return Err(MrError::invalid("no documents to partition"));
    }
    let per_shard = documents.len().div_ceil(n);
    let mut shards: Vec<Shard> = (0..n).map(|i| Shard::new(i, Vec::with_capacity(per_shard))).collect();
    for (i, doc) in documents.into_iter().enumerate() {
        shards[i % n].documents.push(doc);
    }
    Ok(shards)
}
