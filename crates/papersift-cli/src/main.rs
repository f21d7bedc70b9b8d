use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use papersift_core::Source;
use papersift_sync::{crawl_links, SyncConfig, SyncPipeline};
use serde_json::json;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "papersift")]
#[command(about = "Crawl daily AI papers, rate them with an LLM and file the results")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every enabled source, rate each paper and write the tables (default).
    Run,
    /// Rate specific paper links and print the results as JSON.
    Rate {
        #[arg(required = true)]
        links: Vec<String>,
    },
    /// Crawl one source and print the links it would queue.
    Links { source: Source },
    /// Run the daily cron schedule until Ctrl-C.
    Schedule,
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = papersift_sync::run_sync_once_from_env().await?;
            println!(
                "run complete: run_id={} pushed={} rated={} failed={} skipped={} manifest={}",
                summary.run_id,
                summary.pushed,
                summary.tally.rated,
                summary.tally.failed(),
                summary.tally.skipped,
                summary.manifest_path.display()
            );
        }
        Commands::Rate { links } => {
            let config = SyncConfig::from_env();
            let pipeline = SyncPipeline::from_config(&config, Local::now().date_naive()).await?;
            let rated = pipeline.rate_links(&links).await?;
            let report: Vec<_> = rated
                .into_iter()
                .map(|(link, outcome)| match outcome {
                    Ok(result) => json!({ "link": link, "result": result }),
                    Err(err) => json!({
                        "link": link,
                        "failure": err.kind().as_str(),
                        "error": err.to_string(),
                    }),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Links { source } => {
            let config = SyncConfig::from_env();
            let registry = config.load_source_registry().await?;
            let entry = registry
                .get(source)
                .with_context(|| format!("{source} is not listed in sources.yaml"))?;
            let http = config.http_fetcher()?;
            let producer = entry.producer(Local::now().date_naive());
            eprintln!("{source}: {}", producer.period_label());
            for item in crawl_links(producer.as_ref(), &http).await? {
                println!("{}", item.link);
            }
        }
        Commands::Schedule => {
            papersift_sync::run_scheduler_from_env().await?;
        }
    }

    Ok(())
}
