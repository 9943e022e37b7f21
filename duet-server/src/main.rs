use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use duet_core::{
    app::{FunctionSpec, OUTPUT_PATH},
    load_model, ActivityLog, DeviceMap, ModelSource, SDXL_BASE_REPO, SDXL_REFINER_REPO,
};
use duet_server::AppState;
use hf_hub::api::tokio::Api;
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "SDXL base + refiner generation worker")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Base model checkpoint
    #[arg(long, default_value = SDXL_BASE_REPO)]
    base_model: String,

    /// Refiner model checkpoint
    #[arg(long, default_value = SDXL_REFINER_REPO)]
    refiner_model: String,

    /// Load f16 weights
    #[arg(long)]
    use_f16: bool,

    /// Use flash attention in the UNets (needs the `flash-attn` feature)
    #[arg(long)]
    use_flash_attn: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Where `generate_image` writes its PNG
    #[arg(long, default_value = OUTPUT_PATH)]
    output: PathBuf,

    /// Directory for per-user activity logs. Disabled when unset.
    #[arg(long)]
    activity_dir: Option<PathBuf>,

    /// Upper bound on a single function call, in seconds
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

    let source = ModelSource {
        base: args.base_model,
        refiner: args.refiner_model,
        use_f16: args.use_f16,
        use_flash_attn: args.use_flash_attn,
    };
    let model = load_model(&source, Api::new()?, DeviceMap::from_cpu_flag(args.cpu)).await?;

    let function =
        FunctionSpec::generate_image().with_timeout(Duration::from_secs(args.timeout_secs));
    let mut state = AppState::new(model, function, args.output);
    if let Some(dir) = args.activity_dir {
        state = state.with_activity_log(ActivityLog::new(dir));
    }

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    duet_server::serve(listener, Arc::new(state)).await
}
