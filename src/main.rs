use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use traffic_dataset::config::{BatchConfig, Credentials};
use traffic_dataset::pipeline::batch::{BatchStatusEvent, Sleeper, ThreadSleeper};
use traffic_dataset::pipeline::collaborators::{
    http_client, GeminiCaptioner, HttpImageFetcher, HttpOcrClient, SerpApiImageSearch,
};
use traffic_dataset::pipeline::stages::{self, crawl};

/// Build a Vietnamese street-scene image dataset, one resumable stage at a time.
///
/// Every stage checkpoints its output CSV and can be interrupted and rerun;
/// rows that already have a result are never processed again.
#[derive(Parser, Debug)]
#[command(name = "traffic-dataset", version)]
#[command(about = "Crawl, caption, OCR and augment a traffic image dataset")]
struct Cli {
    /// JSON config file (values below it: env TRAFFIC_DATASET_*, then flags)
    #[arg(long, global = true, env = "TRAFFIC_DATASET_CONFIG")]
    config: Option<PathBuf>,

    /// Print progress events as JSON lines on stdout
    #[arg(long, global = true)]
    events: bool,

    #[command(subcommand)]
    command: Command,
}

/// Knobs shared by every stage. Unset flags keep the config/env value.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Records between checkpoints
    #[arg(long)]
    save_interval: Option<usize>,

    /// Attempts per external call
    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-request timeout
    #[arg(long)]
    timeout_seconds: Option<u64>,

    /// Pause between records (or chunks)
    #[arg(long)]
    rate_limit_delay_ms: Option<u64>,

    /// Process rows marked [failed] again
    #[arg(long)]
    retry_failed: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut BatchConfig) {
        if let Some(v) = self.save_interval {
            config.save_interval = v;
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.timeout_seconds {
            config.timeout_seconds = v;
        }
        if let Some(v) = self.rate_limit_delay_ms {
            config.rate_limit_delay_ms = v;
        }
        if self.retry_failed {
            config.retry_failed = true;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search images per query and download the ones that pass the filters
    Crawl {
        /// Text file with one search query per line
        #[arg(long)]
        queries: PathBuf,

        #[arg(long, default_value = "output")]
        output_dir: PathBuf,

        /// Catalog CSV (default: <output-dir>/traffic_images_dataset.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Result pages per query
        #[arg(long)]
        pages: Option<u32>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Fill `short_caption` with a vision-model description
    Caption {
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Defaults to the input file (a backup is written first)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replace the built-in prompt with the contents of this file
        #[arg(long)]
        prompt_file: Option<PathBuf>,

        #[arg(long)]
        model: Option<String>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Fill `caption` from the OCR endpoint
    Ocr {
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Download images and write seeded augmented variants
    Augment {
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[arg(long, default_value = "augmented")]
        output_dir: PathBuf,

        /// Flattened CSV (default: <output-dir>/captions_augmented.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(long)]
        variants: Option<u32>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        workers: Option<usize>,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Delete files that are not decodable images
    Cleanup {
        #[arg(long, default_value = "output/images")]
        images_dir: PathBuf,
    },
}

fn print_event(event: BatchStatusEvent) {
    match serde_json::to_string(&event) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "Cannot encode progress event"),
    }
}

fn main() -> Result<()> {
    traffic_dataset::init_tracing();
    let cli = Cli::parse();

    let mut config = BatchConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let credentials = Credentials::from_env();
    tracing::debug!(?credentials, "Credentials loaded");

    let sleeper: Arc<dyn Sleeper> = Arc::new(ThreadSleeper);
    let printer = print_event;
    let progress: Option<&dyn Fn(BatchStatusEvent)> = if cli.events { Some(&printer) } else { None };

    match cli.command {
        Command::Crawl {
            queries,
            output_dir,
            output,
            pages,
            run,
        } => {
            run.apply(&mut config);
            if output.is_some() {
                config.output_path = output;
            }
            if let Some(pages) = pages {
                config.search_pages = pages;
            }
            config.validate()?;

            let queries = crawl::load_queries(&queries)?;
            anyhow::ensure!(!queries.is_empty(), "no search queries found");
            let client = http_client(config.timeout())?;
            let search = SerpApiImageSearch::new(client.clone(), credentials.serpapi_api_key()?);
            let fetcher = HttpImageFetcher::new(client);

            let summary = stages::run_crawl(
                &config, &queries, &output_dir, &search, &fetcher, sleeper, progress,
            )?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Caption {
            input,
            output,
            prompt_file,
            model,
            run,
        } => {
            run.apply(&mut config);
            config.input_path = input.or(config.input_path);
            config.output_path = output.or(config.output_path);
            if let Some(model) = model {
                config.caption_model = model;
            }
            config.validate()?;

            let prompt = match prompt_file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading prompt file {}", path.display()))?,
                None => stages::DEFAULT_CAPTION_PROMPT.to_string(),
            };
            let client = http_client(config.timeout())?;
            let fetcher = HttpImageFetcher::new(client.clone());
            let captioner =
                GeminiCaptioner::new(client, credentials.gemini_api_key()?, &config.caption_model);

            let summary =
                stages::run_caption(&config, &fetcher, &captioner, prompt.trim(), sleeper, progress)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Ocr { input, output, run } => {
            run.apply(&mut config);
            config.input_path = input.or(config.input_path);
            config.output_path = output.or(config.output_path);
            config.validate()?;

            let client = http_client(config.timeout())?;
            let ocr = HttpOcrClient::new(client, credentials.ocr_endpoint()?);

            let summary = stages::run_ocr(&config, &ocr, sleeper, progress)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Augment {
            input,
            output_dir,
            output,
            variants,
            seed,
            workers,
            run,
        } => {
            run.apply(&mut config);
            config.input_path = input.or(config.input_path);
            config.output_path = output.or(config.output_path);
            if let Some(v) = variants {
                config.augment_variants = v;
            }
            if let Some(v) = seed {
                config.augment_seed = v;
            }
            if let Some(v) = workers {
                config.workers = v;
            }
            config.validate()?;

            let fetcher = HttpImageFetcher::new(http_client(config.timeout())?);
            let summary = stages::run_augment(&config, &output_dir, &fetcher, sleeper, progress)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Cleanup { images_dir } => {
            let report = stages::cleanup_invalid_images(&images_dir)?;
            println!("checked {} files, removed {}", report.checked, report.removed);
        }
    }

    Ok(())
}
