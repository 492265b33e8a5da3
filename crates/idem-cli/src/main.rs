mod logging;
mod rows;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idem_core::FlowRecord;
use idem_sync::{
    ensure_flow, report_markdown, BatchController, ControllerOutcome, ControllerSettings,
    EnrichmentEngine, IdentityProcessor, PipelineConfig, Poller, Stores,
};
use rows::Row;
use tokio_cron_scheduler::JobScheduler;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "idem-cli")]
#[command(about = "Idempotent file batch pipeline")]
struct Cli {
    /// Pipeline YAML; `IDEM_*` environment variables are read when omitted.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the flow and register the row entity.
    Init,
    /// Consume at most one pending input file.
    Once,
    /// Poll the input directory until Ctrl-C.
    Run {
        /// Drive polls from a job scheduler instead of the built-in interval loop.
        #[arg(long)]
        scheduled: bool,
    },
    /// Apply pending enrichers to one source address, or to every latest snapshot.
    Enrich {
        #[arg(long)]
        address: Option<String>,
    },
    /// Print a markdown summary of the flow.
    Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::from_env()?,
    };
    info!(
        flow = %config.flow_code,
        input = %config.input_directory.display(),
        output = %config.output_directory.display(),
        "pipeline configured"
    );
    let stores = Stores::open(&config.output_directory);

    match cli.command.unwrap_or(Commands::Once) {
        Commands::Init => {
            let flow =
                ensure_flow::<Row>(&stores.flows, &config.flow_code, config.display_name()).await?;
            println!(
                "flow `{}` ready: batch={} entities={}",
                flow.code,
                flow.current_batch_id(),
                flow.entities.len()
            );
        }
        Commands::Once => match controller(&config, &stores).await?.run_once().await? {
            ControllerOutcome::Processed(snapshot) => println!(
                "processed {} as {}: valid={} invalid={} errors={}",
                snapshot.source_address_id,
                snapshot.batch,
                snapshot.valid_count(),
                snapshot.invalid_count(),
                snapshot.errors.len()
            ),
            ControllerOutcome::NoFileFound { warning } => {
                println!("{}", warning.unwrap_or_else(|| "no pending input files".to_string()))
            }
        },
        Commands::Run { scheduled } => {
            let controller = controller(&config, &stores).await?;
            let poller = Arc::new(Poller::new(Arc::new(controller), config.poll_interval()));
            if scheduled {
                let mut sched = JobScheduler::new().await.context("creating scheduler")?;
                let job_id = Arc::clone(&poller).schedule(&sched).await?;
                sched.start().await.context("starting scheduler")?;
                info!(%job_id, "poll job scheduled");
                wait_for_ctrl_c().await;
                sched.shutdown().await.context("stopping scheduler")?;
            } else {
                poller.run(wait_for_ctrl_c()).await?;
            }
        }
        Commands::Enrich { address } => {
            ensure_flow::<Row>(&stores.flows, &config.flow_code, config.display_name()).await?;
            let engine = config.enrichers.iter().fold(
                EnrichmentEngine::new(
                    &config.flow_code,
                    &config.process_name,
                    &stores,
                    rows::validator(&config),
                ),
                |engine, enricher| engine.with_enricher(rows::csv_enricher(enricher)),
            );
            if engine.enricher_ids().is_empty() {
                println!("no enrichers configured");
                return Ok(());
            }
            let outcomes: Vec<_> = match address {
                Some(address) => engine.enrich_address(&address).await?.into_iter().collect(),
                None => engine.enrich_pending().await?,
            };
            let mut applied = 0;
            for outcome in &outcomes {
                for entry in &outcome.applied {
                    applied += 1;
                    println!(
                        "{} -> {}: {} enriched, snapshot {}",
                        entry.enricher_id,
                        entry.target_address_id,
                        entry.entities_enriched,
                        outcome.snapshot.target_address_id
                    );
                }
            }
            if applied == 0 {
                println!("nothing to enrich");
            }
        }
        Commands::Report => {
            let report = report_markdown(
                &stores,
                &config.flow_code,
                Row::ENTITY_TYPE_ID,
                &config.process_name,
            )
            .await?;
            println!("{report}");
        }
    }

    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("listening for ctrl-c: {err}");
    }
}

async fn controller(config: &PipelineConfig, stores: &Stores) -> Result<BatchController<Row, Row>> {
    ensure_flow::<Row>(&stores.flows, &config.flow_code, config.display_name()).await?;
    Ok(BatchController::new(
        ControllerSettings::from(config),
        stores,
        Arc::new(IdentityProcessor),
        rows::validator(config),
    ))
}
