use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use duet_cli::RemoteFunction;
use duet_core::{
    app::{FunctionSpec, DEFAULT_PROMPT},
    GenerationRequest,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the SDXL generation function on a worker")]
struct Args {
    /// Base URL of the worker
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    url: String,

    /// Text prompt
    #[arg(long, default_value = DEFAULT_PROMPT)]
    prompt: String,

    /// Name recorded in the worker's activity log
    #[arg(long)]
    username: Option<String>,

    /// Seed for the initial noise
    #[arg(long)]
    seed: Option<u64>,

    /// Upper bound on the call, in seconds
    #[arg(long, default_value_t = 3600)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let function =
        FunctionSpec::generate_image().with_timeout(Duration::from_secs(args.timeout_secs));
    let remote = RemoteFunction::new(&args.url, &function)?;

    let mut request = GenerationRequest::new(args.prompt);
    request.username = args.username;
    request.seed = args.seed;

    println!("Starting the image generation process...");
    let result = remote.remote(&request).await?;
    println!("{result}");
    Ok(())
}
