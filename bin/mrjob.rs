use std::time::Duration;

use clap::Parser;

use minimr::{
    mr::{JobConfig, Master},
    mrapps, mrrt,
};

#[derive(Parser)]
#[command(name = "mrjob")]
struct Args {
    app: String,
    input_files: Vec<String>,
    #[arg(long, default_value_t = 8)]
    partitions: usize,
    /// Defaults to --partitions
    #[arg(long)]
    mappers: Option<usize>,
    /// Defaults to --partitions
    #[arg(long)]
    reducers: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
    #[arg(long)]
    task_timeout_ms: Option<u64>,
    #[arg(long, default_value = "mr-out-0")]
    output: String,
}

impl Args {
    fn config(&self) -> JobConfig {
        let mut config = JobConfig::new(self.partitions).with_max_attempts(self.max_attempts);
        if let Some(n) = self.mappers {
            config = config.with_mappers(n);
        }
        if let Some(n) = self.reducers {
            config = config.with_reducers(n);
        }
        if let Some(n) = self.workers {
            config = config.with_workers(n);
        }
        if let Some(ms) = self.task_timeout_ms {
            config = config.with_task_timeout(Duration::from_millis(ms));
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let args = Args::try_parse()?;

    let app = mrapps::get_app(&args.app)?;
    let documents = mrrt::read_documents(&args.input_files).await?;

    let master = Master::new(args.config());
    let handle = master.submit(documents, app)?;
    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, cancelling job");
            canceller.cancel();
        }
    });

    let result = handle.join().await?;
    mrrt::write_output(&args.output, &result).await?;
    log::info!("wrote {} keys to {}", result.len(), args.output);

    Ok(())
}
