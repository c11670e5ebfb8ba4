use clap::Parser;

use minimr::{mrapps, mrrt};

#[derive(Parser)]
#[command(name = "mrsequential")]
struct Args {
    app: String,
    input_files: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let args = Args::try_parse()?;

    log::info!("app: {}, files: {:?}", args.app, args.input_files);
    let app = mrapps::get_app(&args.app)?;
    let documents = mrrt::read_documents(&args.input_files).await?;

    let result = mrrt::sequential::run(&app, &documents)?;
    mrrt::write_output("mr-out-0", &result).await?;

    Ok(())
}
