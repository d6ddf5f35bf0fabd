use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use disaster_labeler::config::AppConfig;
use disaster_labeler::package;
use disaster_labeler::parser::PayloadFormat;
use disaster_labeler::pipeline::BatchDriver;
use disaster_labeler::shutdown::wait_for_shutdown;
use disaster_labeler::vision::{OpenAiClient, VisionClient};

#[derive(Parser)]
#[command(
    name = "disaster-labeler",
    about = "Label disaster images with structured characteristics using a hosted vision model"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Label every pending image in the data directory
    Label {
        /// Directory holding `<id>.<ext>` images and their outputs
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Maximum concurrent completion calls
        #[arg(short, long)]
        workers: Option<usize>,
        /// First id of the range to label (requires --end)
        #[arg(long, requires = "end")]
        start: Option<u64>,
        /// Last id of the range to label (requires --start)
        #[arg(long, requires = "start")]
        end: Option<u64>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
        /// Clear failure markers left by earlier runs before starting
        #[arg(long)]
        retry_failed: bool,
    },
    /// Combine labeled images into a single fine-tuning JSON file
    Package {
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Where to write the JSON array
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },
    /// Analyze a single image and print the extracted payload
    Analyze {
        image: PathBuf,
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for PayloadFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => PayloadFormat::Csv,
            FormatArg::Json => PayloadFormat::Json,
        }
    }
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn vision_client(config: &AppConfig) -> anyhow::Result<Arc<dyn VisionClient>> {
    let client = OpenAiClient::new(&config.vision)?;
    tracing::info!(
        provider = ?config.vision.provider,
        model = %client.model(),
        "Vision client ready"
    );
    Ok(Arc::new(client))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Label {
            data_dir,
            workers,
            start,
            end,
            format,
            retry_failed,
        } => {
            if let Some(dir) = data_dir {
                config.pipeline.data_dir = dir;
            }
            if let Some(workers) = workers {
                config.pipeline.max_workers = workers;
            }
            if start.is_some() {
                config.pipeline.start_id = start;
                config.pipeline.end_id = end;
            }
            if let Some(format) = format {
                config.pipeline.format = format.into();
            }
            config.validate()?;

            let driver = BatchDriver::from_config(&config, vision_client(&config)?)?;

            if retry_failed {
                let cleared = driver.store().clear_failures().await?;
                tracing::info!(count = cleared, "Cleared failure markers");
            }

            let summary = driver.run_until(wait_for_shutdown()).await?;

            tracing::info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "Labeling complete"
            );
        }
        Command::Package {
            data_dir,
            output,
            format,
        } => {
            if let Some(dir) = data_dir {
                config.pipeline.data_dir = dir;
            }
            if let Some(output) = output {
                config.package.output = output;
            }
            if let Some(format) = format {
                config.pipeline.format = format.into();
            }
            config.validate()?;

            let store = disaster_labeler::pipeline::store_from_config(&config)?;
            let prompt = disaster_labeler::prompt::load_prompt(
                config.pipeline.prompt_file.as_deref(),
                config.pipeline.format,
            )?;

            package::write_package(
                &store,
                &prompt,
                config.pipeline.format,
                &config.package.output,
            )
            .await?;
        }
        Command::Analyze { image, format } => {
            if let Some(format) = format {
                config.pipeline.format = format.into();
            }
            config.validate()?;

            let driver = BatchDriver::from_config(&config, vision_client(&config)?)?;

            let bytes = tokio::fs::read(&image)
                .await
                .with_context(|| format!("Failed to read {}", image.display()))?;
            let bytes = driver.prepare_image(bytes).await?;

            let (result, attempts) = driver.enrich(&bytes).await;
            tracing::info!(attempts, success = result.is_success(), "Analysis finished");

            match result.payload {
                Some(payload) => println!("{payload}"),
                None => {
                    if let Some(raw) = &result.raw {
                        tracing::debug!(raw = %raw, "Model response");
                    }
                    anyhow::bail!(
                        "Analysis failed: {}",
                        result.error.unwrap_or_else(|| "no payload".to_string())
                    );
                }
            }
        }
    }

    Ok(())
}
