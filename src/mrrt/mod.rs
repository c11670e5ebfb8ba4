pub mod sequential;

use std::path::Path;

use tokio::{fs::File, io::AsyncWriteExt as _};

use crate::mr::{Document, JobResult};

/// Reads each input file into one document, numbered in argument order.
pub async fn read_documents<P: AsRef<Path>>(input_files: &[P]) -> Result<Vec<Document>, anyhow::Error> {
    let mut documents = Vec::with_capacity(input_files.len());
    for (i, file) in input_files.iter().enumerate() {
        let contents = tokio::fs::read_to_string(file.as_ref()).await?;
        documents.push(Document::new(i, contents));
    }
    Ok(documents)
}

/// Writes one `key value` line per key, in key order.
pub async fn write_output(path: impl AsRef<Path>, result: &JobResult) -> Result<(), anyhow::Error> {
    let mut out = File::create(path).await?;
    for (key, value) in result.iter() {
        out.write_all(format!("{} {}\n", String::from_utf8_lossy(key), value).as_bytes()).await?;
    }
    out.flush().await?;
    Ok(())
}
