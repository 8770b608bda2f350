use std::path::PathBuf;

use addis_normalizer::{DatasetNormalizer, IdPolicy, NormalizeRunSummary, NormalizerConfig};
use addis_web::WebConfig;
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "addis-cli")]
#[command(about = "Live Addis dataset pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download post images and write the clean dataset.
    Normalize(NormalizeArgs),
    /// Serve the clean dataset as a read-only JSON API.
    Serve(ServeArgs),
}

#[derive(Debug, Default, Args)]
struct NormalizeArgs {
    #[arg(long, env = "ADDIS_INPUT_PATH")]
    input: Option<PathBuf>,
    #[arg(long, env = "ADDIS_OUTPUT_PATH")]
    output: Option<PathBuf>,
    #[arg(long, env = "ADDIS_ASSETS_DIR")]
    assets_dir: Option<PathBuf>,
    #[arg(long, env = "ADDIS_PUBLIC_MOUNT")]
    public_mount: Option<String>,
    #[arg(long, env = "ADDIS_TRUSTED_HOST")]
    trusted_host: Option<String>,
    #[arg(long, env = "ADDIS_ID_POLICY")]
    id_policy: Option<IdPolicy>,
    /// Parallel downloads; 1 keeps them sequential.
    #[arg(long, env = "ADDIS_FETCH_CONCURRENCY")]
    concurrency: Option<usize>,
    #[arg(long, env = "ADDIS_HTTP_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,
    #[arg(long, env = "ADDIS_MAX_RETRIES")]
    max_retries: Option<usize>,
    /// Print the run summary as JSON instead of text.
    #[arg(long)]
    summary_json: bool,
}

impl NormalizeArgs {
    fn apply(&self, mut config: NormalizerConfig) -> NormalizerConfig {
        if let Some(input) = &self.input {
            config.input_path = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if let Some(assets_dir) = &self.assets_dir {
            config.assets_dir = assets_dir.clone();
        }
        if let Some(public_mount) = &self.public_mount {
            config.public_mount = public_mount.clone();
        }
        if let Some(trusted_host) = &self.trusted_host {
            config.trusted_host_fragment = trusted_host.clone();
        }
        if let Some(id_policy) = self.id_policy {
            config.id_policy = id_policy;
        }
        if let Some(concurrency) = self.concurrency {
            config.fetch_concurrency = concurrency.max(1);
        }
        if let Some(timeout_secs) = self.timeout_secs {
            config.http_timeout_secs = timeout_secs;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_retries = max_retries;
        }
        config
    }
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, env = "ADDIS_WEB_PORT")]
    port: Option<u16>,
    #[arg(long, env = "ADDIS_DATASET_PATH")]
    dataset: Option<PathBuf>,
    #[arg(long, env = "ADDIS_BLOCKLIST_PATH")]
    blocklist: Option<PathBuf>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_summary(summary: &NormalizeRunSummary) {
    println!(
        "normalize complete: run_id={} posts_read={} posts_written={} downloaded={} reused={} dropped={}",
        summary.run_id,
        summary.tally.posts_read,
        summary.tally.posts_written,
        summary.tally.media_downloaded,
        summary.tally.media_reused,
        summary.tally.media_dropped.values().sum::<usize>()
    );
    println!("images saved to: {}", summary.assets_dir);
    println!("clean data saved to: {}", summary.output_path);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli
        .command
        .unwrap_or_else(|| Commands::Normalize(NormalizeArgs::default()))
    {
        Commands::Normalize(args) => {
            let config = args.apply(NormalizerConfig::from_env());
            let summary = DatasetNormalizer::new(config)?.run_once().await?;
            if args.summary_json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
        }
        Commands::Serve(args) => {
            let mut config = WebConfig::from_env();
            if let Some(port) = args.port {
                config.port = port;
            }
            if let Some(dataset) = args.dataset {
                config.dataset_path = dataset;
            }
            if let Some(blocklist) = args.blocklist {
                config.blocklist_path = blocklist;
            }
            addis_web::serve(config).await?;
        }
    }

    Ok(())
}
